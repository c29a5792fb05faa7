// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use crate::StorageError;

/// A filesystem mount of a block device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub device: PathBuf,
    pub target: PathBuf,
    pub fs_type: String,
    pub read_only: bool,
    /// Filesystem-specific data (e.g. "uid=0,gid=1023,fmask=0007")
    pub options: String,
}

/// A loop device bound to a backing file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
}

/// Privileged mount-table operations
#[async_trait]
pub trait MountOpsAdapter: Send + Sync {
    async fn check_filesystem(&self, device: &Path, fs_type: &str) -> Result<(), StorageError>;

    async fn mount_filesystem(&self, request: &MountRequest) -> Result<(), StorageError>;

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), StorageError>;

    /// Unmount `target`; a busy mount reports `StorageErrorKind::Busy`
    async fn unmount(&self, target: &Path, detach: bool) -> Result<(), StorageError>;

    async fn is_mounted(&self, target: &Path) -> Result<bool, StorageError>;

    /// Mount points strictly below `root`, deepest first
    async fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>, StorageError>;

    async fn attach_loop(&self, image: &Path) -> Result<LoopDevice, StorageError>;

    async fn detach_loop(&self, device: &Path) -> Result<(), StorageError>;

    /// Mount a FUSE session at `target` for `uid` and return the device descriptor
    async fn mount_fuse(&self, target: &Path, uid: u32) -> Result<OwnedFd, StorageError>;
}
