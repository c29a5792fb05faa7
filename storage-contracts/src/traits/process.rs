// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::StorageError;

/// One mount-namespace adjustment applied inside a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemountEntry {
    Bind {
        source: PathBuf,
        target: PathBuf,
        read_only: bool,
    },
    Unmount {
        target: PathBuf,
    },
}

/// What a running process currently sees at a mount target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountAccess {
    Absent,
    ReadOnly,
    ReadWrite,
}

/// Running-process inspection and in-namespace remounting
#[async_trait]
pub trait ProcessOpsAdapter: Send + Sync {
    async fn pids_for_uid(&self, uid: u32) -> Result<Vec<i32>, StorageError>;

    /// Access of `pid` to `target` inside its own mount namespace
    async fn mount_access(&self, pid: i32, target: &Path) -> Result<MountAccess, StorageError>;

    async fn remount_in_namespace(
        &self,
        pid: i32,
        entries: &[RemountEntry],
    ) -> Result<(), StorageError>;
}
