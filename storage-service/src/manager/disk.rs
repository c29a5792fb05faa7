// SPDX-License-Identifier: GPL-3.0-only

//! Disk records and their volume scans

use std::collections::BTreeSet;

use storage_contracts::{KeyBuffer, PartitionEntry, PartitionKind};
use storage_types::{DiskFlags, DiskInfo, VolumeEvent};
use tracing::{debug, info, warn};

use super::state::ManagerState;
use super::volume::{PrivateVolume, PublicVolume, Volume, VolumeKind};
use super::VolumeManager;

/// One block device and the volumes found on it
#[derive(Debug, Clone)]
pub struct Disk {
    pub id: String,
    pub major: u32,
    pub minor: u32,
    pub sys_path: String,
    pub device_paths: BTreeSet<String>,
    pub nickname: String,
    pub flags: DiskFlags,
    pub size: u64,
    pub label: String,
    /// Partition topology of the last scan
    pub partitions: Vec<PartitionEntry>,
    pub volumes: Vec<String>,
    pub pending: bool,
}

impl Disk {
    pub fn new(
        id: String,
        major: u32,
        minor: u32,
        sys_path: impl Into<String>,
        nickname: impl Into<String>,
        flags: DiskFlags,
    ) -> Self {
        Self {
            id,
            major,
            minor,
            sys_path: sys_path.into(),
            device_paths: BTreeSet::new(),
            nickname: nickname.into(),
            flags,
            size: 0,
            label: String::new(),
            partitions: Vec::new(),
            volumes: Vec::new(),
            pending: false,
        }
    }

    pub fn info(&self) -> DiskInfo {
        DiskInfo {
            id: self.id.clone(),
            major: self.major,
            minor: self.minor,
            sys_path: self.sys_path.clone(),
            device_paths: self.device_paths.iter().cloned().collect(),
            nickname: self.nickname.clone(),
            flags: self.flags,
            size: self.size,
            label: self.label.clone(),
            pending: self.pending,
            volumes: self.volumes.clone(),
        }
    }
}

fn volume_id_for(entry: &PartitionEntry) -> String {
    match entry.kind {
        PartitionKind::Public => format!("public:{},{}", entry.major, entry.minor),
        PartitionKind::Private { .. } => format!("private:{},{}", entry.major, entry.minor),
    }
}

impl VolumeManager {
    /// Announce, probe and register a disk
    pub(super) async fn create_disk(&self, state: &mut ManagerState, mut disk: Disk) {
        disk.pending = false;
        info!("Creating disk {} ({}) at {}", disk.id, disk.nickname, disk.sys_path);
        self.notifier.push(VolumeEvent::DiskCreated {
            disk_id: disk.id.clone(),
            flags: disk.flags,
        });

        self.read_disk_metadata(&mut disk).await;
        let partitions = self.read_disk_partitions(&disk).await;
        self.build_volumes(state, &mut disk, partitions);
        self.notifier.push(VolumeEvent::DiskScanned {
            disk_id: disk.id.clone(),
        });
        state.disks.push(disk);
    }

    async fn read_disk_metadata(&self, disk: &mut Disk) {
        match self
            .adapters
            .probe
            .read_metadata(&disk.sys_path, disk.major, disk.minor)
            .await
        {
            Ok(metadata) => {
                disk.size = metadata.size;
                disk.label = metadata.label;
                self.notifier.push(VolumeEvent::DiskMetadataChanged {
                    disk_id: disk.id.clone(),
                    size: disk.size,
                    label: disk.label.clone(),
                    sys_path: disk.sys_path.clone(),
                });
            }
            Err(e) => warn!("Failed to read metadata of {}: {}", disk.id, e),
        }
    }

    async fn read_disk_partitions(&self, disk: &Disk) -> Vec<PartitionEntry> {
        match self
            .adapters
            .probe
            .read_partitions(&disk.sys_path, disk.major, disk.minor)
            .await
        {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!("Failed to read partitions of {}: {}", disk.id, e);
                Vec::new()
            }
        }
    }

    fn load_key(&self, part_guid: &str) -> Option<KeyBuffer> {
        let path = storage_sys::keys::key_path(&self.config.paths.key_dir, part_guid).ok()?;
        match storage_sys::keys::read_key(&path) {
            Ok(bytes) => Some(KeyBuffer::new(bytes)),
            Err(e) => {
                debug!("No key for partition {}: {}", part_guid, e);
                None
            }
        }
    }

    fn build_volumes(
        &self,
        state: &mut ManagerState,
        disk: &mut Disk,
        partitions: Vec<PartitionEntry>,
    ) {
        for entry in &partitions {
            let id = volume_id_for(entry);
            if state.volumes.contains_key(&id) {
                warn!("Volume {} already exists, skipping", id);
                continue;
            }

            let kind = match &entry.kind {
                PartitionKind::Public => VolumeKind::Public(PublicVolume {
                    device: entry.device.clone(),
                    major: entry.major,
                    minor: entry.minor,
                }),
                PartitionKind::Private { part_guid } => VolumeKind::Private(PrivateVolume::new(
                    entry.device.clone(),
                    entry.major,
                    entry.minor,
                    part_guid.clone(),
                    self.load_key(part_guid),
                )),
            };
            let volume = Volume::new(id.clone(), kind, Some(disk.id.clone()));
            debug!("Found volume {} on {}", id, disk.id);
            self.notifier.push(volume.created_event());
            state.volumes.insert(id.clone(), volume);
            disk.volumes.push(id);
        }
        disk.partitions = partitions;
    }

    /// Re-read metadata and rebuild volumes when the partition table changed
    pub(super) async fn rescan_disk(&self, state: &mut ManagerState, disk_id: &str) {
        let Some(index) = state.disks.iter().position(|disk| disk.id == disk_id) else {
            debug!("Change for unknown disk {}", disk_id);
            return;
        };
        let mut disk = state.disks.remove(index);

        self.read_disk_metadata(&mut disk).await;
        let partitions = self.read_disk_partitions(&disk).await;
        if partitions != disk.partitions {
            info!("Partition table of {} changed, rebuilding volumes", disk.id);
            for volume_id in std::mem::take(&mut disk.volumes) {
                self.destroy_volume(state, &volume_id).await;
            }
            self.build_volumes(state, &mut disk, partitions);
        }
        self.notifier.push(VolumeEvent::DiskScanned {
            disk_id: disk.id.clone(),
        });
        state.disks.insert(index, disk);
    }

    /// Unmount (best effort) and forget one volume
    pub(super) async fn destroy_volume(&self, state: &mut ManagerState, volume_id: &str) {
        let mounted = state.volume(volume_id).is_some_and(|v| v.state.is_mounted());
        if mounted {
            if let Err(e) = self.unmount_locked(state, volume_id).await {
                warn!("Unmount of {} during removal failed: {}", volume_id, e);
            }
        }
        if let Some(volume) = state.volumes.remove(volume_id) {
            self.discard_volume(state, volume);
        }
    }

    /// Destroy every volume of `disk`, then the disk itself
    pub(super) async fn destroy_disk(&self, state: &mut ManagerState, disk: Disk) {
        info!("Destroying disk {}", disk.id);
        for volume_id in &disk.volumes {
            self.destroy_volume(state, volume_id).await;
        }
        self.notifier.push(VolumeEvent::DiskDestroyed { disk_id: disk.id });
    }
}
