// SPDX-License-Identifier: GPL-3.0-only

//! Block-device events, deferred disks and the virtual disk

use storage_types::{DeviceAction, DeviceEvent, DiskFlag, VolumeEvent, disk_id_for};
use tracing::{debug, info, warn};

use super::VolumeManager;
use super::disk::Disk;
use super::disk_source::classify;
use super::state::{ManagerState, VirtualDisk};
use crate::error::Result;

const VIRTUAL_DISK_IMAGE: &str = "virtual_disk";
const VIRTUAL_DISK_SYS_PATH: &str = "/virtual";

fn virtual_disk_record(virtual_disk: &VirtualDisk) -> Disk {
    let loop_device = &virtual_disk.loop_device;
    let mut disk = Disk::new(
        virtual_disk.disk_id.clone(),
        loop_device.major,
        loop_device.minor,
        VIRTUAL_DISK_SYS_PATH,
        "virtual",
        DiskFlag::Adoptable | DiskFlag::Sd,
    );
    disk.device_paths
        .insert(loop_device.path.display().to_string());
    disk
}

impl VolumeManager {
    /// Apply one kernel block-device event
    pub async fn handle_block_event(&self, event: DeviceEvent) {
        {
            let mut state = self.state.lock().await;
            self.handle_block_event_locked(&mut state, event).await;
        }
        self.notifier.flush();
    }

    async fn handle_block_event_locked(&self, state: &mut ManagerState, event: DeviceEvent) {
        if state.debug {
            info!("Block event {:?} {} {:?}", event.action, event.sys_path, event.attributes);
        } else {
            debug!("Block event {:?} {}", event.action, event.sys_path);
        }

        if event.devtype() != Some("disk") {
            return;
        }
        let (Some(major), Some(minor)) = (event.major(), event.minor()) else {
            warn!("Ignoring {} without device numbers", event.sys_path);
            return;
        };
        let disk_id = disk_id_for(major, minor);

        match event.action {
            DeviceAction::Add => {
                if state.find_disk(&disk_id).is_some() || state.is_pending(&disk_id) {
                    debug!("Disk {} already known", disk_id);
                    return;
                }
                let Some(source) = classify(&self.sources, &event.sys_path) else {
                    debug!("No disk source matches {}", event.sys_path);
                    return;
                };
                let mut disk = Disk::new(
                    disk_id,
                    major,
                    minor,
                    event.sys_path.clone(),
                    source.nickname(),
                    source.flags(),
                );
                if let Some(device_path) = &event.device_path {
                    disk.device_paths.insert(device_path.clone());
                }
                self.handle_disk_added(state, disk).await;
            }
            DeviceAction::Change => {
                if state.find_disk(&disk_id).is_some() {
                    self.rescan_disk(state, &disk_id).await;
                } else {
                    debug!("Change for untracked disk {}", disk_id);
                }
            }
            DeviceAction::Remove => {
                if let Some(index) = state.pending_disks.iter().position(|d| d.id == disk_id) {
                    state.pending_disks.remove(index);
                    info!("Dropped pending disk {}", disk_id);
                } else if let Some(index) = state.disks.iter().position(|d| d.id == disk_id) {
                    let disk = state.disks.remove(index);
                    self.destroy_disk(state, disk).await;
                }
            }
        }
    }

    /// Create `disk` now, or park it until probing is allowed
    pub(super) async fn handle_disk_added(&self, state: &mut ManagerState, mut disk: Disk) {
        if state.defers_disks() {
            info!("Deferring disk {} until user 0 is unlocked", disk.id);
            disk.pending = true;
            state.pending_disks.push(disk);
            return;
        }
        self.create_disk(state, disk).await;
    }

    /// Create every parked disk once nothing defers them any more
    pub(super) async fn flush_pending(&self, state: &mut ManagerState) {
        if state.defers_disks() {
            return;
        }
        for disk in std::mem::take(&mut state.pending_disks) {
            self.create_disk(state, disk).await;
        }
    }

    pub async fn on_secure_keyguard_state_changed(&self, showing: bool) {
        {
            let mut state = self.state.lock().await;
            state.secure_keyguard_showing = showing;
            if !showing {
                self.flush_pending(&mut state).await;
            }
        }
        self.notifier.flush();
    }

    pub async fn set_virtual_disk(&self, enabled: bool) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            state.virtual_disk_enabled = enabled;
            self.update_virtual_disk_locked(&mut state).await
        };
        self.notifier.flush();
        result
    }

    pub async fn update_virtual_disk(&self) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.update_virtual_disk_locked(&mut state).await
        };
        self.notifier.flush();
        result
    }

    pub(super) async fn update_virtual_disk_locked(&self, state: &mut ManagerState) -> Result<()> {
        match (state.virtual_disk_enabled, state.virtual_disk.is_some()) {
            (true, false) => self.attach_virtual_disk(state).await,
            (false, true) => self.detach_virtual_disk(state).await,
            _ => Ok(()),
        }
    }

    async fn attach_virtual_disk(&self, state: &mut ManagerState) -> Result<()> {
        let image = self.config.paths.key_dir.join(VIRTUAL_DISK_IMAGE);
        let size = self.config.virtual_disk.size_mb * 1024 * 1024;
        if storage_sys::keys::create_sparse_image(&image, size)? {
            info!("Created virtual disk image {}", image.display());
        }

        let loop_device = self.adapters.mounts.attach_loop(&image).await?;
        let virtual_disk = VirtualDisk {
            disk_id: disk_id_for(loop_device.major, loop_device.minor),
            image,
            loop_device,
        };
        info!(
            "Virtual disk {} attached at {}",
            virtual_disk.disk_id,
            virtual_disk.loop_device.path.display()
        );
        let disk = virtual_disk_record(&virtual_disk);
        state.virtual_disk = Some(virtual_disk);
        self.handle_disk_added(state, disk).await;
        Ok(())
    }

    async fn detach_virtual_disk(&self, state: &mut ManagerState) -> Result<()> {
        let Some(virtual_disk) = state.virtual_disk.take() else {
            return Ok(());
        };

        if let Some(index) = state.pending_disks.iter().position(|d| d.id == virtual_disk.disk_id) {
            state.pending_disks.remove(index);
        } else if let Some(index) = state.disks.iter().position(|d| d.id == virtual_disk.disk_id) {
            let disk = state.disks.remove(index);
            self.destroy_disk(state, disk).await;
        }

        self.adapters
            .mounts
            .detach_loop(&virtual_disk.loop_device.path)
            .await?;
        if let Err(e) = std::fs::remove_file(&virtual_disk.image) {
            warn!("Failed to remove {}: {}", virtual_disk.image.display(), e);
        }
        info!("Virtual disk {} removed", virtual_disk.disk_id);
        Ok(())
    }

    /// Re-register a still-attached virtual disk after a reset
    pub(super) async fn readd_virtual_disk(
        &self,
        state: &mut ManagerState,
        virtual_disk: VirtualDisk,
    ) {
        let disk = virtual_disk_record(&virtual_disk);
        state.virtual_disk = Some(virtual_disk);
        self.handle_disk_added(state, disk).await;
    }
}
