// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::StorageError;

/// Disk-level metadata read at creation and on change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskMetadata {
    pub size: u64,
    pub label: String,
}

/// How a partition is surfaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKind {
    Public,
    /// Adopted partition identified by its partition GUID
    Private { part_guid: String },
}

/// One partition (or the whole disk when it carries no table)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub major: u32,
    pub minor: u32,
    pub device: PathBuf,
    pub kind: PartitionKind,
}

/// Filesystem metadata of a block device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsMetadata {
    pub fs_type: String,
    pub fs_uuid: String,
    pub fs_label: String,
}

/// Partition and filesystem probing
#[async_trait]
pub trait DiskProbeAdapter: Send + Sync {
    async fn read_metadata(&self, sys_path: &str, major: u32, minor: u32)
    -> Result<DiskMetadata, StorageError>;

    async fn read_partitions(
        &self,
        sys_path: &str,
        major: u32,
        minor: u32,
    ) -> Result<Vec<PartitionEntry>, StorageError>;

    async fn read_fs_metadata(
        &self,
        device: &Path,
        major: u32,
        minor: u32,
    ) -> Result<FsMetadata, StorageError>;
}
