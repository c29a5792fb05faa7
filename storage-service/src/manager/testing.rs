// SPDX-License-Identifier: GPL-3.0-only

//! In-memory collaborators and a ready-made orchestrator for tests

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use storage_contracts::{
    DiskMetadata, DiskProbeAdapter, FsMetadata, KeyBuffer, KeyOpsAdapter, LoopDevice,
    MountAccess, MountOpsAdapter, MountRequest, OwnershipOpsAdapter, PartitionEntry, PartitionKind,
    ProcessOpsAdapter, RemountEntry, StorageError, StorageErrorKind, VolumeListener,
};
use storage_types::{DeviceAction, DeviceEvent, MountState, VolumeEvent};
use tempfile::TempDir;

use super::state::Notifier;
use super::{Adapters, CryptGate, MountEnv, VolumeManager};
use crate::config::ServiceConfig;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MountTable {
    mounted: BTreeSet<PathBuf>,
    busy: BTreeSet<PathBuf>,
    failing: BTreeSet<PathBuf>,
    loops: BTreeSet<PathBuf>,
    next_loop: u32,
    unmount_attempts: usize,
    binds: usize,
}

/// Mount table kept in memory
#[derive(Default)]
pub struct FakeMounts {
    table: Mutex<MountTable>,
}

impl FakeMounts {
    pub fn is_mounted_sync(&self, target: &Path) -> bool {
        locked(&self.table).mounted.contains(target)
    }

    /// Pretend someone else mounted `target`
    pub fn insert_mount(&self, target: &Path) {
        locked(&self.table).mounted.insert(target.to_path_buf());
    }

    pub fn set_busy(&self, target: &Path, busy: bool) {
        let mut table = locked(&self.table);
        if busy {
            table.busy.insert(target.to_path_buf());
        } else {
            table.busy.remove(target);
        }
    }

    pub fn fail_mounts_of(&self, device: &str) {
        locked(&self.table).failing.insert(PathBuf::from(device));
    }

    pub fn clear_failures(&self) {
        locked(&self.table).failing.clear();
    }

    pub fn unmount_attempts(&self) -> usize {
        locked(&self.table).unmount_attempts
    }

    pub fn bind_count(&self) -> usize {
        locked(&self.table).binds
    }

    pub fn loops_attached(&self) -> usize {
        locked(&self.table).loops.len()
    }
}

fn scripted(kind: StorageErrorKind, message: String) -> StorageError {
    StorageError::new(kind, message)
}

#[async_trait]
impl MountOpsAdapter for FakeMounts {
    async fn check_filesystem(&self, device: &Path, _fs_type: &str) -> Result<(), StorageError> {
        if locked(&self.table).failing.contains(device) {
            return Err(scripted(
                StorageErrorKind::Internal,
                format!("fsck failed on {}", device.display()),
            ));
        }
        Ok(())
    }

    async fn mount_filesystem(&self, request: &MountRequest) -> Result<(), StorageError> {
        let mut table = locked(&self.table);
        if table.failing.contains(&request.device) {
            return Err(scripted(
                StorageErrorKind::Internal,
                format!("cannot mount {}", request.device.display()),
            ));
        }
        table.mounted.insert(request.target.clone());
        Ok(())
    }

    async fn bind_mount(
        &self,
        _source: &Path,
        target: &Path,
        _read_only: bool,
    ) -> Result<(), StorageError> {
        let mut table = locked(&self.table);
        table.mounted.insert(target.to_path_buf());
        table.binds += 1;
        Ok(())
    }

    async fn unmount(&self, target: &Path, _detach: bool) -> Result<(), StorageError> {
        let mut table = locked(&self.table);
        table.unmount_attempts += 1;
        if table.busy.contains(target) {
            return Err(scripted(
                StorageErrorKind::Busy,
                format!("{} is busy", target.display()),
            ));
        }
        if !table.mounted.remove(target) {
            return Err(scripted(
                StorageErrorKind::InvalidInput,
                format!("{} is not mounted", target.display()),
            ));
        }
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, StorageError> {
        Ok(self.is_mounted_sync(target))
    }

    async fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let points: Vec<PathBuf> = locked(&self.table).mounted.iter().cloned().collect();
        Ok(storage_sys::mounts::select_under(&points, root))
    }

    async fn attach_loop(&self, _image: &Path) -> Result<LoopDevice, StorageError> {
        let mut table = locked(&self.table);
        let minor = table.next_loop;
        table.next_loop += 1;
        let path = PathBuf::from(format!("/dev/loop{minor}"));
        table.loops.insert(path.clone());
        Ok(LoopDevice { path, major: 7, minor })
    }

    async fn detach_loop(&self, device: &Path) -> Result<(), StorageError> {
        locked(&self.table).loops.remove(device);
        Ok(())
    }

    async fn mount_fuse(&self, target: &Path, _uid: u32) -> Result<OwnedFd, StorageError> {
        let device = File::open("/dev/null")?;
        locked(&self.table).mounted.insert(target.to_path_buf());
        Ok(OwnedFd::from(device))
    }
}

#[derive(Default)]
struct KeyTable {
    installed: Vec<String>,
    next: u32,
    fail_installs: bool,
}

/// Key service that hands out sequential references
#[derive(Default)]
pub struct FakeKeys {
    table: Mutex<KeyTable>,
}

impl FakeKeys {
    /// References currently installed
    pub fn installed(&self) -> Vec<String> {
        locked(&self.table).installed.clone()
    }

    pub fn fail_installs(&self, fail: bool) {
        locked(&self.table).fail_installs = fail;
    }
}

#[async_trait]
impl KeyOpsAdapter for FakeKeys {
    async fn install_key(
        &self,
        key: &KeyBuffer,
        _mountpoint: &Path,
        _policy_version: u32,
    ) -> Result<String, StorageError> {
        let mut table = locked(&self.table);
        if table.fail_installs || key.is_empty() {
            return Err(scripted(StorageErrorKind::Internal, "install refused".to_string()));
        }
        let raw_ref = format!("ref-{}", table.next);
        table.next += 1;
        table.installed.push(raw_ref.clone());
        Ok(raw_ref)
    }

    async fn evict_key(
        &self,
        _mountpoint: &Path,
        raw_ref: &str,
        _policy_version: u32,
    ) -> Result<(), StorageError> {
        let mut table = locked(&self.table);
        let before = table.installed.len();
        table.installed.retain(|r| r != raw_ref);
        if table.installed.len() == before {
            return Err(scripted(StorageErrorKind::NotFound, format!("no key {raw_ref}")));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ProbeTable {
    metadata: HashMap<String, DiskMetadata>,
    partitions: HashMap<String, Vec<PartitionEntry>>,
    filesystems: HashMap<PathBuf, FsMetadata>,
}

/// Disk prober answering from scripted tables
///
/// Unscripted disks carry no partition table; unscripted devices hold vfat.
#[derive(Default)]
pub struct FakeProbe {
    table: Mutex<ProbeTable>,
}

impl FakeProbe {
    pub fn set_metadata(&self, sys_path: &str, size: u64, label: &str) {
        locked(&self.table).metadata.insert(
            sys_path.to_string(),
            DiskMetadata {
                size,
                label: label.to_string(),
            },
        );
    }

    pub fn set_partitions(&self, sys_path: &str, partitions: Vec<PartitionEntry>) {
        locked(&self.table)
            .partitions
            .insert(sys_path.to_string(), partitions);
    }

    pub fn set_fs(&self, device: &str, fs_type: &str, fs_uuid: &str) {
        locked(&self.table).filesystems.insert(
            PathBuf::from(device),
            FsMetadata {
                fs_type: fs_type.to_string(),
                fs_uuid: fs_uuid.to_string(),
                fs_label: String::new(),
            },
        );
    }
}

#[async_trait]
impl DiskProbeAdapter for FakeProbe {
    async fn read_metadata(
        &self,
        sys_path: &str,
        _major: u32,
        _minor: u32,
    ) -> Result<DiskMetadata, StorageError> {
        Ok(locked(&self.table)
            .metadata
            .get(sys_path)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_partitions(
        &self,
        sys_path: &str,
        major: u32,
        minor: u32,
    ) -> Result<Vec<PartitionEntry>, StorageError> {
        let table = locked(&self.table);
        Ok(table.partitions.get(sys_path).cloned().unwrap_or_else(|| {
            vec![PartitionEntry {
                major,
                minor,
                device: PathBuf::from(format!("/dev/block/{major}:{minor}")),
                kind: PartitionKind::Public,
            }]
        }))
    }

    async fn read_fs_metadata(
        &self,
        device: &Path,
        major: u32,
        minor: u32,
    ) -> Result<FsMetadata, StorageError> {
        Ok(locked(&self.table)
            .filesystems
            .get(device)
            .cloned()
            .unwrap_or_else(|| FsMetadata {
                fs_type: "vfat".to_string(),
                fs_uuid: format!("UUID-{major}-{minor}"),
                fs_label: String::new(),
            }))
    }
}

#[derive(Default)]
struct ProcessTable {
    pids: BTreeMap<u32, Vec<i32>>,
    failing: BTreeSet<i32>,
    access: BTreeMap<i32, MountAccess>,
    applied: Vec<(i32, Vec<RemountEntry>)>,
}

/// Process table with scripted remount failures
#[derive(Default)]
pub struct FakeProcesses {
    table: Mutex<ProcessTable>,
}

impl FakeProcesses {
    pub fn set_pids(&self, uid: u32, pids: Vec<i32>) {
        locked(&self.table).pids.insert(uid, pids);
    }

    pub fn fail_pid(&self, pid: i32) {
        locked(&self.table).failing.insert(pid);
    }

    pub fn set_access(&self, pid: i32, access: MountAccess) {
        locked(&self.table).access.insert(pid, access);
    }

    /// Successful remounts in call order
    pub fn applied(&self) -> Vec<(i32, Vec<RemountEntry>)> {
        locked(&self.table).applied.clone()
    }
}

#[async_trait]
impl ProcessOpsAdapter for FakeProcesses {
    async fn pids_for_uid(&self, uid: u32) -> Result<Vec<i32>, StorageError> {
        Ok(locked(&self.table).pids.get(&uid).cloned().unwrap_or_default())
    }

    async fn mount_access(&self, pid: i32, _target: &Path) -> Result<MountAccess, StorageError> {
        let table = locked(&self.table);
        Ok(table.access.get(&pid).copied().unwrap_or(MountAccess::Absent))
    }

    async fn remount_in_namespace(
        &self,
        pid: i32,
        entries: &[RemountEntry],
    ) -> Result<(), StorageError> {
        let mut table = locked(&self.table);
        if table.failing.contains(&pid) {
            return Err(scripted(StorageErrorKind::NotFound, format!("pid {pid} exited")));
        }
        if let Some(last) = entries.last() {
            let access = match last {
                RemountEntry::Bind { read_only: true, .. } => MountAccess::ReadOnly,
                RemountEntry::Bind { .. } => MountAccess::ReadWrite,
                RemountEntry::Unmount { .. } => MountAccess::Absent,
            };
            table.access.insert(pid, access);
        }
        table.applied.push((pid, entries.to_vec()));
        Ok(())
    }
}

/// Ownership map; paths never chowned belong to root
#[derive(Default)]
pub struct FakeOwnership {
    owners: Mutex<HashMap<PathBuf, (u32, u32)>>,
    changes: Mutex<usize>,
}

impl FakeOwnership {
    pub fn owner_of(&self, path: &Path) -> (u32, u32) {
        locked(&self.owners).get(path).copied().unwrap_or((0, 0))
    }

    /// Number of ownership changes applied so far
    pub fn changes(&self) -> usize {
        *locked(&self.changes)
    }
}

#[async_trait]
impl OwnershipOpsAdapter for FakeOwnership {
    async fn owner(&self, path: &Path) -> Result<(u32, u32), StorageError> {
        Ok(self.owner_of(path))
    }

    async fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<(), StorageError> {
        locked(&self.owners).insert(path.to_path_buf(), (uid, gid));
        *locked(&self.changes) += 1;
        Ok(())
    }
}

/// Listener that keeps every event
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<VolumeEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<VolumeEvent> {
        locked(&self.events).clone()
    }

    pub fn state_changes(&self, volume: &str) -> Vec<(MountState, MountState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                VolumeEvent::VolumeStateChanged { volume_id, old, new } if volume_id == volume => {
                    Some((old, new))
                }
                _ => None,
            })
            .collect()
    }

    pub fn count_created(&self, volume: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                matches!(event, VolumeEvent::VolumeCreated { volume_id, .. } if volume_id == volume)
            })
            .count()
    }

    /// Whether a destroyed event for the disk or volume `id` was seen
    pub fn destroyed(&self, id: &str) -> bool {
        self.events().iter().any(|event| match event {
            VolumeEvent::VolumeDestroyed { volume_id } => volume_id == id,
            VolumeEvent::DiskDestroyed { disk_id } => disk_id == id,
            _ => false,
        })
    }
}

impl VolumeListener for RecordingListener {
    fn notify(&self, event: VolumeEvent) {
        locked(&self.events).push(event);
    }
}

pub fn disk_event(action: DeviceAction, sys_path: &str, major: u32, minor: u32) -> DeviceEvent {
    DeviceEvent::new(action, sys_path)
        .with_attribute("MAJOR", major.to_string())
        .with_attribute("MINOR", minor.to_string())
        .with_attribute("DEVTYPE", "disk")
}

/// A whole-disk USB stick `name` at major 8
pub fn usb_event(action: DeviceAction, name: &str, minor: u32) -> DeviceEvent {
    disk_event(action, &format!("/devices/pci0/usb1/block/{name}"), 8, minor)
        .with_device_path(format!("/dev/{name}"))
}

/// Every entry below `root` with its permission bits, sorted
pub fn tree_snapshot(root: &Path) -> Vec<(PathBuf, u32)> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(children) = std::fs::read_dir(&dir) else {
            continue;
        };
        for child in children.flatten() {
            let path = child.path();
            let Ok(metadata) = std::fs::symlink_metadata(&path) else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(path.clone());
            }
            entries.push((path, metadata.permissions().mode() & 0o7777));
        }
    }
    entries.sort();
    entries
}

/// Orchestrator wired to fakes, rooted in a temporary directory
pub struct TestBed {
    _dir: TempDir,
    pub config: ServiceConfig,
    pub mounts: Arc<FakeMounts>,
    pub keys: Arc<FakeKeys>,
    pub probe: Arc<FakeProbe>,
    pub processes: Arc<FakeProcesses>,
    pub ownership: Arc<FakeOwnership>,
    pub listener: Arc<RecordingListener>,
    pub adapters: Adapters,
    pub crypt: CryptGate,
    pub notifier: Notifier,
    pub manager: VolumeManager,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(customize: impl FnOnce(&mut ServiceConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        let mut config = ServiceConfig::default();
        {
            let paths = &mut config.paths;
            paths.storage_root = base.join("storage");
            paths.media_rw_root = base.join("mnt/media_rw");
            paths.expand_root = base.join("mnt/expand");
            paths.user_root = base.join("mnt/user");
            paths.runtime_root = base.join("mnt/runtime");
            paths.obb_root = base.join("mnt/obb");
            paths.appfuse_root = base.join("mnt/appfuse");
            paths.data_media = base.join("data/media");
            paths.key_dir = base.join("data/misc/vold");
        }
        customize(&mut config);
        for path in [
            &config.paths.storage_root,
            &config.paths.media_rw_root,
            &config.paths.expand_root,
            &config.paths.user_root,
            &config.paths.runtime_root,
            &config.paths.obb_root,
            &config.paths.appfuse_root,
            &config.paths.data_media,
            &config.paths.key_dir,
        ] {
            std::fs::create_dir_all(path).unwrap();
        }

        let mounts = Arc::new(FakeMounts::default());
        let keys = Arc::new(FakeKeys::default());
        let probe = Arc::new(FakeProbe::default());
        let processes = Arc::new(FakeProcesses::default());
        let ownership = Arc::new(FakeOwnership::default());
        let listener = Arc::new(RecordingListener::default());
        let adapters = Adapters {
            mounts: mounts.clone(),
            keys: keys.clone(),
            probe: probe.clone(),
            processes: processes.clone(),
            ownership: ownership.clone(),
        };

        let manager =
            VolumeManager::new(config.clone(), adapters.clone(), listener.clone()).unwrap();
        Self {
            _dir: dir,
            crypt: CryptGate::new(keys.clone(), config.key_policy_version),
            notifier: Notifier::new(listener.clone()),
            config,
            mounts,
            keys,
            probe,
            processes,
            ownership,
            listener,
            adapters,
            manager,
        }
    }

    /// Started orchestrator with user 0 running
    pub async fn started() -> Self {
        let bed = Self::new();
        bed.start_user_zero().await;
        bed
    }

    pub async fn start_user_zero(&self) {
        self.manager.start().await.unwrap();
        self.manager.on_user_added(0, 0).await.unwrap();
        self.manager
            .on_user_started(0, Vec::new(), Vec::new(), Vec::new())
            .await
            .unwrap();
    }

    pub fn env(&self) -> MountEnv<'_> {
        MountEnv {
            config: &self.config,
            adapters: &self.adapters,
            crypt: &self.crypt,
        }
    }

    pub async fn add_usb_disk(&self, name: &str, minor: u32) {
        self.manager
            .handle_block_event(usb_event(DeviceAction::Add, name, minor))
            .await;
    }

    pub async fn volume_path(&self, volume_id: &str) -> PathBuf {
        let info = self.manager.find_volume(volume_id).await.unwrap();
        PathBuf::from(info.path.unwrap())
    }
}
