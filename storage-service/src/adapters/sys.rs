// SPDX-License-Identifier: GPL-3.0-only

//! Adapters binding the orchestrator's collaborator traits to `storage-sys`
//!
//! Every call runs on the blocking pool: mount syscalls, external tools and
//! sysfs reads may stall for seconds.

use async_trait::async_trait;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use storage_contracts::{
    DiskMetadata, DiskProbeAdapter, FsMetadata, KeyBuffer, KeyOpsAdapter, LoopDevice,
    MountAccess, MountOpsAdapter, MountRequest, OwnershipOpsAdapter, PartitionEntry, PartitionKind,
    ProcessOpsAdapter, RemountEntry, StorageError, StorageErrorKind,
};
use storage_sys::process::NamespaceOp;
use storage_sys::sysfs::SysPartition;
use storage_sys::{SysfsProbe, keys, mounts, ownership, process};
use tokio::task::spawn_blocking;
use tracing::warn;

use crate::error::storage_error;
use crate::manager::Adapters;

pub fn build_default_adapters(probe: SysfsProbe) -> Adapters {
    Adapters {
        mounts: Arc::new(SysMountAdapter::new()),
        keys: Arc::new(SysKeyAdapter::new()),
        probe: Arc::new(SysfsProbeAdapter::new(probe)),
        processes: Arc::new(ProcfsProcessAdapter::new()),
        ownership: Arc::new(SysOwnershipAdapter::new()),
    }
}

async fn blocking<T, F>(op: F) -> Result<T, StorageError>
where
    F: FnOnce() -> storage_sys::Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(op)
        .await
        .map_err(|e| {
            StorageError::new(StorageErrorKind::Internal, format!("blocking task failed: {e}"))
        })?
        .map_err(storage_error)
}

#[derive(Clone, Default)]
pub struct SysMountAdapter;

impl SysMountAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MountOpsAdapter for SysMountAdapter {
    async fn check_filesystem(&self, device: &Path, fs_type: &str) -> Result<(), StorageError> {
        let device = device.to_path_buf();
        let fs_type = fs_type.to_string();
        blocking(move || mounts::check_filesystem(&device, &fs_type)).await
    }

    async fn mount_filesystem(&self, request: &MountRequest) -> Result<(), StorageError> {
        let request = request.clone();
        blocking(move || {
            mounts::mount_filesystem(
                &request.device,
                &request.target,
                &request.fs_type,
                request.read_only,
                &request.options,
            )
        })
        .await
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), StorageError> {
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        blocking(move || mounts::bind_mount(&source, &target, read_only)).await
    }

    async fn unmount(&self, target: &Path, detach: bool) -> Result<(), StorageError> {
        let target = target.to_path_buf();
        blocking(move || mounts::unmount(&target, detach)).await
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, StorageError> {
        let target = target.to_path_buf();
        blocking(move || mounts::is_mounted(&target)).await
    }

    async fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let root = root.to_path_buf();
        blocking(move || mounts::mounts_under(&root)).await
    }

    async fn attach_loop(&self, image: &Path) -> Result<LoopDevice, StorageError> {
        let image = image.to_path_buf();
        let (path, major, minor) = blocking(move || mounts::attach_loop(&image)).await?;
        Ok(LoopDevice { path, major, minor })
    }

    async fn detach_loop(&self, device: &Path) -> Result<(), StorageError> {
        let device = device.to_path_buf();
        blocking(move || mounts::detach_loop(&device)).await
    }

    async fn mount_fuse(&self, target: &Path, uid: u32) -> Result<OwnedFd, StorageError> {
        let target = target.to_path_buf();
        blocking(move || mounts::mount_fuse(&target, uid)).await
    }
}

#[derive(Clone, Default)]
pub struct SysKeyAdapter;

impl SysKeyAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl KeyOpsAdapter for SysKeyAdapter {
    async fn install_key(
        &self,
        key: &KeyBuffer,
        mountpoint: &Path,
        policy_version: u32,
    ) -> Result<String, StorageError> {
        let key = KeyBuffer::new(key.as_bytes().to_vec());
        let mountpoint = mountpoint.to_path_buf();
        blocking(move || keys::install_key(key.as_bytes(), &mountpoint, policy_version)).await
    }

    async fn evict_key(
        &self,
        mountpoint: &Path,
        raw_ref: &str,
        policy_version: u32,
    ) -> Result<(), StorageError> {
        let mountpoint = mountpoint.to_path_buf();
        let raw_ref = raw_ref.to_string();
        blocking(move || keys::evict_key(&mountpoint, &raw_ref, policy_version)).await
    }
}

#[derive(Clone)]
pub struct SysfsProbeAdapter {
    probe: SysfsProbe,
}

impl SysfsProbeAdapter {
    pub fn new(probe: SysfsProbe) -> Self {
        Self { probe }
    }
}

fn partition_entry(partition: SysPartition) -> PartitionEntry {
    let kind = match (partition.is_private(), partition.part_uuid) {
        (true, Some(part_guid)) => PartitionKind::Private { part_guid },
        (true, None) => {
            warn!(
                "Private partition {}:{} has no partition GUID, treating as public",
                partition.major, partition.minor
            );
            PartitionKind::Public
        }
        (false, _) => PartitionKind::Public,
    };
    PartitionEntry {
        major: partition.major,
        minor: partition.minor,
        device: partition.device,
        kind,
    }
}

#[async_trait]
impl DiskProbeAdapter for SysfsProbeAdapter {
    async fn read_metadata(
        &self,
        sys_path: &str,
        major: u32,
        minor: u32,
    ) -> Result<DiskMetadata, StorageError> {
        let probe = self.probe.clone();
        let sys_path = sys_path.to_string();
        let (size, label) = blocking(move || probe.read_metadata(&sys_path, major, minor)).await?;
        Ok(DiskMetadata { size, label })
    }

    async fn read_partitions(
        &self,
        sys_path: &str,
        major: u32,
        minor: u32,
    ) -> Result<Vec<PartitionEntry>, StorageError> {
        let probe = self.probe.clone();
        let sys_path = sys_path.to_string();
        blocking(move || {
            let partitions = probe.read_partitions(&sys_path, major, minor)?;
            if partitions.is_empty() {
                // No table: the disk itself carries the filesystem.
                return Ok(vec![PartitionEntry {
                    major,
                    minor,
                    device: probe.disk_node(&sys_path, major, minor),
                    kind: PartitionKind::Public,
                }]);
            }
            Ok(partitions.into_iter().map(partition_entry).collect())
        })
        .await
    }

    async fn read_fs_metadata(
        &self,
        _device: &Path,
        major: u32,
        minor: u32,
    ) -> Result<FsMetadata, StorageError> {
        let probe = self.probe.clone();
        let info = blocking(move || probe.read_fs_metadata(major, minor)).await?;
        Ok(FsMetadata {
            fs_type: info.fs_type,
            fs_uuid: info.fs_uuid,
            fs_label: info.fs_label,
        })
    }
}

#[derive(Clone, Default)]
pub struct ProcfsProcessAdapter;

impl ProcfsProcessAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn namespace_op(entry: &RemountEntry) -> NamespaceOp<'_> {
    match entry {
        RemountEntry::Bind {
            source,
            target,
            read_only,
        } => NamespaceOp::Bind {
            source,
            target,
            read_only: *read_only,
        },
        RemountEntry::Unmount { target } => NamespaceOp::Unmount { target },
    }
}

#[async_trait]
impl ProcessOpsAdapter for ProcfsProcessAdapter {
    async fn pids_for_uid(&self, uid: u32) -> Result<Vec<i32>, StorageError> {
        blocking(move || process::pids_for_uid(uid)).await
    }

    async fn mount_access(&self, pid: i32, target: &Path) -> Result<MountAccess, StorageError> {
        let target = target.to_path_buf();
        let read_only = blocking(move || mounts::mount_access_in(pid, &target)).await?;
        Ok(match read_only {
            None => MountAccess::Absent,
            Some(true) => MountAccess::ReadOnly,
            Some(false) => MountAccess::ReadWrite,
        })
    }

    async fn remount_in_namespace(
        &self,
        pid: i32,
        entries: &[RemountEntry],
    ) -> Result<(), StorageError> {
        let entries = entries.to_vec();
        blocking(move || {
            for entry in &entries {
                process::remount_in_namespace(pid, namespace_op(entry))?;
            }
            Ok(())
        })
        .await
    }
}

#[derive(Clone, Default)]
pub struct SysOwnershipAdapter;

impl SysOwnershipAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OwnershipOpsAdapter for SysOwnershipAdapter {
    async fn owner(&self, path: &Path) -> Result<(u32, u32), StorageError> {
        let path = path.to_path_buf();
        blocking(move || ownership::owner(&path)).await
    }

    async fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<(), StorageError> {
        let path = path.to_path_buf();
        blocking(move || ownership::set_owner(&path, uid, gid)).await
    }
}
