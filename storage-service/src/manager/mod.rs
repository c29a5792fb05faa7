// SPDX-License-Identifier: GPL-3.0-only

//! The volume orchestrator
//!
//! `VolumeManager` owns every disk, volume and user binding. All mutation runs
//! under the general state lock; key installation and eviction additionally
//! pass through the [`CryptGate`]. Listener events are queued while the lock is
//! held and delivered once it has been released.

mod auxiliary;
mod crypt;
mod devices;
mod disk;
mod disk_source;
mod primary;
mod remount;
mod sandbox;
mod state;
mod users;
mod volume;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;
use std::sync::Arc;

use storage_contracts::{
    DiskProbeAdapter, KeyOpsAdapter, MountOpsAdapter, OwnershipOpsAdapter, ProcessOpsAdapter,
    VolumeListener,
};
use storage_types::{
    DiskInfo, MountFlag, MountFlags, MountState, UserId, VolumeEvent, VolumeInfo, VolumeType,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};

pub use crypt::CryptGate;
pub use disk_source::DiskSource;
use state::{ManagerState, Notifier};
use volume::{EmulatedVolume, Volume, VolumeKind};

pub const EMULATED_VOLUME_ID: &str = "emulated";

/// External collaborators the orchestrator drives
#[derive(Clone)]
pub struct Adapters {
    pub mounts: Arc<dyn MountOpsAdapter>,
    pub keys: Arc<dyn KeyOpsAdapter>,
    pub probe: Arc<dyn DiskProbeAdapter>,
    pub processes: Arc<dyn ProcessOpsAdapter>,
    pub ownership: Arc<dyn OwnershipOpsAdapter>,
}

/// Borrowed context handed to volume drivers
pub struct MountEnv<'a> {
    pub config: &'a ServiceConfig,
    pub adapters: &'a Adapters,
    pub crypt: &'a CryptGate,
}

/// Report every failed item of a batch operation
pub(crate) fn batch_result(operation: &str, failures: Vec<(String, ServiceError)>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    Err(ServiceError::PartialFailure {
        operation: operation.to_string(),
        failed: failures.into_iter().map(|(name, _)| name).collect(),
    })
}

/// Collapse per-item failures, keeping a lone error as-is
pub(crate) fn aggregate(operation: &str, mut failures: Vec<(String, ServiceError)>) -> Result<()> {
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0).1),
        _ => Err(ServiceError::PartialFailure {
            operation: operation.to_string(),
            failed: failures.into_iter().map(|(name, _)| name).collect(),
        }),
    }
}

pub struct VolumeManager {
    config: ServiceConfig,
    adapters: Adapters,
    sources: Vec<DiskSource>,
    crypt: CryptGate,
    state: Mutex<ManagerState>,
    notifier: Notifier,
}

impl VolumeManager {
    pub fn new(
        config: ServiceConfig,
        adapters: Adapters,
        listener: Arc<dyn VolumeListener>,
    ) -> Result<Self> {
        let sources = config
            .disk_sources
            .iter()
            .map(DiskSource::from_config)
            .collect::<Result<Vec<_>>>()?;
        let crypt = CryptGate::new(adapters.keys.clone(), config.key_policy_version);

        Ok(Self {
            config,
            adapters,
            sources,
            crypt,
            state: Mutex::new(ManagerState::default()),
            notifier: Notifier::new(listener),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn env(&self) -> MountEnv<'_> {
        MountEnv {
            config: &self.config,
            adapters: &self.adapters,
            crypt: &self.crypt,
        }
    }

    pub async fn set_debug(&self, enabled: bool) {
        self.state.lock().await.debug = enabled;
    }

    /// Create the internal emulated volume and apply the virtual-disk setting
    pub async fn start(&self) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.start_locked(&mut state).await
        };
        self.notifier.flush();
        result
    }

    async fn start_locked(&self, state: &mut ManagerState) -> Result<()> {
        if !state.started {
            state.started = true;
            state.virtual_disk_enabled = self.config.virtual_disk.enabled;
        }
        if !state.volumes.contains_key(EMULATED_VOLUME_ID) {
            let volume = Volume::new(
                EMULATED_VOLUME_ID,
                VolumeKind::Emulated(EmulatedVolume {
                    source: self.config.paths.data_media.clone(),
                }),
                None,
            );
            self.notifier.push(volume.created_event());
            state.volumes.insert(EMULATED_VOLUME_ID.to_string(), volume);
        }
        if let Err(e) = self.update_virtual_disk_locked(state).await {
            warn!("Virtual disk update failed: {}", e);
        }
        info!("Volume manager started");
        Ok(())
    }

    /// Nothing to tear down beyond what `shutdown` does
    pub async fn stop(&self) -> Result<()> {
        info!("Volume manager stopped");
        Ok(())
    }

    /// Forget all disks, volumes and user state without touching mounts
    pub async fn reset(&self) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.reset_locked(&mut state).await
        };
        self.notifier.flush();
        result
    }

    async fn reset_locked(&self, state: &mut ManagerState) -> Result<()> {
        info!("Resetting volume manager state");
        for disk in &state.disks {
            for volume_id in &disk.volumes {
                self.notifier.push(VolumeEvent::VolumeDestroyed {
                    volume_id: volume_id.clone(),
                });
            }
            self.notifier.push(VolumeEvent::DiskDestroyed {
                disk_id: disk.id.clone(),
            });
        }
        for volume in state.volumes.values().filter(|v| v.disk_id.is_none()) {
            self.notifier.push(VolumeEvent::VolumeDestroyed {
                volume_id: volume.id.clone(),
            });
        }

        let previous = std::mem::take(state);
        state.debug = previous.debug;
        state.started = previous.started;
        state.secure_keyguard_showing = previous.secure_keyguard_showing;
        state.virtual_disk_enabled = previous.virtual_disk_enabled;
        state.next_obb_id = previous.next_obb_id;
        state.next_stub_id = previous.next_stub_id;

        if let Some(virtual_disk) = previous.virtual_disk {
            self.readd_virtual_disk(state, virtual_disk).await;
        }
        if state.started {
            self.start_locked(state).await?;
        }
        Ok(())
    }

    /// Unmount everything in order, then destroy every disk and volume
    pub async fn shutdown(&self) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.shutdown_locked(&mut state).await
        };
        self.notifier.flush();
        result
    }

    async fn shutdown_locked(&self, state: &mut ManagerState) -> Result<()> {
        info!("Shutting down all volumes");
        let failures = self.unmount_in_order(state).await;

        for disk in std::mem::take(&mut state.disks) {
            for volume_id in &disk.volumes {
                if let Some(volume) = state.volumes.remove(volume_id) {
                    self.discard_volume(state, volume);
                }
            }
            self.notifier.push(VolumeEvent::DiskDestroyed { disk_id: disk.id });
        }
        for volume in std::mem::take(&mut state.volumes).into_values() {
            self.discard_volume(state, volume);
        }
        state.pending_disks.clear();
        state.visible_volume_ids.clear();
        state.primary = None;

        batch_result("shutdown", failures)
    }

    /// Unmount every volume and sweep stray mounts below the managed roots
    pub async fn unmount_all(&self) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            let failures = self.unmount_in_order(&mut state).await;
            self.sweep_stray_mounts().await;
            batch_result("unmountAll", failures)
        };
        self.notifier.flush();
        result
    }

    /// App-fuse, OBB, stub, disk-backed, then emulated volumes
    fn unmount_order(state: &ManagerState) -> Vec<String> {
        let rank = |volume: &Volume| match volume.volume_type() {
            VolumeType::AppFuse => 0,
            VolumeType::Obb => 1,
            VolumeType::Stub => 2,
            VolumeType::Public | VolumeType::Private => 3,
            VolumeType::Emulated => 4,
        };

        let mut order: Vec<String> = Vec::new();
        for pass in 0..=4 {
            if pass == 3 {
                order.extend(state.disks.iter().flat_map(|disk| disk.volumes.iter().cloned()));
                continue;
            }
            order.extend(
                state
                    .volumes
                    .values()
                    .filter(|volume| rank(volume) == pass)
                    .map(|volume| volume.id.clone()),
            );
        }
        order
    }

    async fn unmount_in_order(&self, state: &mut ManagerState) -> Vec<(String, ServiceError)> {
        let mut failures = Vec::new();
        for id in Self::unmount_order(state) {
            let mounted = state.volume(&id).is_some_and(|v| v.state.is_mounted());
            if !mounted {
                continue;
            }
            if let Err(e) = self.unmount_locked(state, &id).await {
                warn!("Failed to unmount {}: {}", id, e);
                failures.push((id, e));
            }
        }
        failures
    }

    async fn sweep_stray_mounts(&self) {
        let paths = &self.config.paths;
        for root in [
            &paths.user_root,
            &paths.media_rw_root,
            &paths.expand_root,
            &paths.obb_root,
            &paths.appfuse_root,
        ] {
            let stray = match self.adapters.mounts.mounts_under(root).await {
                Ok(stray) => stray,
                Err(e) => {
                    warn!("Failed to list mounts under {}: {}", root.display(), e);
                    continue;
                }
            };
            for target in stray {
                if let Err(e) = self.adapters.mounts.unmount(&target, true).await {
                    warn!("Failed to detach stray mount {}: {}", target.display(), e);
                }
            }
        }
    }

    /// Mark `volume` removed and notify; never touches mounts
    fn discard_volume(&self, state: &mut ManagerState, mut volume: Volume) {
        let terminal = if volume.state.is_mounted() {
            MountState::BadRemoval
        } else {
            MountState::Removed
        };
        volume.set_state(terminal, &self.notifier);
        state.visible_volume_ids.remove(&volume.id);
        self.clear_primary(state, &volume.id);
        self.notifier.push(VolumeEvent::VolumeDestroyed {
            volume_id: volume.id,
        });
    }

    pub async fn mount(
        &self,
        volume_id: &str,
        flags: MountFlags,
        user: Option<UserId>,
    ) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.mount_locked(&mut state, volume_id, flags, user).await
        };
        self.notifier.flush();
        result
    }

    async fn mount_locked(
        &self,
        state: &mut ManagerState,
        volume_id: &str,
        flags: MountFlags,
        user: Option<UserId>,
    ) -> Result<()> {
        let env = self.env();
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ServiceError::NotFound(format!("volume {volume_id}")))?;
        if !volume.state.can_mount() {
            return Err(ServiceError::precondition(format!(
                "Volume {volume_id} is {}",
                volume.state
            )));
        }

        volume.mount_flags = flags;
        volume.mount_user_id = user;
        volume.mount(&env, &self.notifier).await?;

        if flags.contains(MountFlag::Visible) {
            state.visible_volume_ids.insert(volume_id.to_string());
            if let Some(volume) = state.volume(volume_id) {
                if let Err(e) = self.materialize_volume(state, volume).await {
                    warn!("Sandboxes on {} incomplete: {}", volume_id, e);
                }
            }
        }
        if flags.contains(MountFlag::Primary) {
            if let Err(e) = self.set_primary_locked(state, volume_id).await {
                warn!("Could not make {} primary: {}", volume_id, e);
            }
        }
        Ok(())
    }

    pub async fn unmount(&self, volume_id: &str) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.unmount_locked(&mut state, volume_id).await
        };
        self.notifier.flush();
        result
    }

    async fn unmount_locked(&self, state: &mut ManagerState, volume_id: &str) -> Result<()> {
        let volume = state
            .volume(volume_id)
            .ok_or_else(|| ServiceError::NotFound(format!("volume {volume_id}")))?;
        if !volume.state.is_mounted() {
            return Err(ServiceError::precondition(format!(
                "Volume {volume_id} is {}",
                volume.state
            )));
        }

        if let Err(e) = self.teardown_volume(state, volume).await {
            warn!("Sandbox teardown on {} incomplete: {}", volume_id, e);
        }

        if let Some(path) = volume.internal_path.as_deref() {
            let holders = self.adapters.mounts.mounts_under(path).await?;
            if !holders.is_empty() {
                self.rematerialize(state, volume_id).await;
                return Err(ServiceError::Busy(format!(
                    "{volume_id} still has {} mount(s) below it",
                    holders.len()
                )));
            }
        }

        let env = self.env();
        let Some(volume) = state.volumes.get_mut(volume_id) else {
            return Err(ServiceError::NotFound(format!("volume {volume_id}")));
        };
        let result = volume.unmount(&env, &self.notifier).await;
        match &result {
            Err(e) if e.is_busy() => self.rematerialize(state, volume_id).await,
            _ => {
                state.visible_volume_ids.remove(volume_id);
                self.clear_primary(state, volume_id);
            }
        }
        result
    }

    async fn rematerialize(&self, state: &ManagerState, volume_id: &str) {
        if !state.visible_volume_ids.contains(volume_id) {
            return;
        }
        if let Some(volume) = state.volume(volume_id) {
            if let Err(e) = self.materialize_volume(state, volume).await {
                warn!("Failed to restore sandboxes on {}: {}", volume_id, e);
            }
        }
    }

    /// Ensure the directories along `path` exist below a mounted volume
    pub async fn mkdirs(&self, path: &Path) -> Result<()> {
        let state = self.state.lock().await;
        let roots = state.mounted_roots();
        storage_sys::mkdirs(path, &roots)?;
        Ok(())
    }

    /// Delete the stored key of a private partition
    pub async fn forget_partition(&self, part_guid: &str, fs_uuid: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let key_path = storage_sys::keys::key_path(&self.config.paths.key_dir, part_guid)?;
        storage_sys::keys::forget_key(&key_path)?;

        for volume in state.volumes.values_mut() {
            if let VolumeKind::Private(private) = &mut volume.kind {
                if private.part_guid.eq_ignore_ascii_case(part_guid) {
                    private.key = None;
                }
            }
        }
        info!("Forgot partition {} (filesystem {})", part_guid, fs_uuid);
        Ok(())
    }

    pub async fn list_volumes(&self, volume_type: Option<VolumeType>) -> Vec<VolumeInfo> {
        let state = self.state.lock().await;
        state
            .volumes
            .values()
            .filter(|volume| volume_type.is_none_or(|t| volume.volume_type() == t))
            .map(Volume::info)
            .collect()
    }

    pub async fn list_disks(&self) -> Vec<DiskInfo> {
        let state = self.state.lock().await;
        state
            .disks
            .iter()
            .chain(state.pending_disks.iter())
            .map(|disk| disk.info())
            .collect()
    }

    pub async fn find_disk(&self, disk_id: &str) -> Option<DiskInfo> {
        let state = self.state.lock().await;
        state
            .disks
            .iter()
            .chain(state.pending_disks.iter())
            .find(|disk| disk.id == disk_id)
            .map(|disk| disk.info())
    }

    pub async fn find_volume(&self, volume_id: &str) -> Option<VolumeInfo> {
        self.state.lock().await.volume(volume_id).map(Volume::info)
    }

    pub async fn primary_volume(&self) -> Option<String> {
        self.state.lock().await.primary.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::TestBed;
    use storage_types::{DeviceAction, DeviceEvent};

    #[tokio::test]
    async fn start_creates_the_emulated_volume_once() {
        let bed = TestBed::new();
        bed.manager.start().await.unwrap();
        bed.manager.start().await.unwrap();

        let volumes = bed.manager.list_volumes(Some(VolumeType::Emulated)).await;
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].state, MountState::Unmounted);
        assert_eq!(bed.listener.count_created(EMULATED_VOLUME_ID), 1);
    }

    #[tokio::test]
    async fn double_mount_reports_precondition_and_keeps_state() {
        let bed = TestBed::started().await;
        bed.add_usb_disk("sdb", 16).await;
        let id = "public:8,16";

        bed.manager.mount(id, MountFlags::empty(), None).await.unwrap();
        let err = bed
            .manager
            .mount(id, MountFlags::empty(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Precondition(_)));
        assert_eq!(crate::error::status::<()>(&Err(err)), -libc::EPERM);
        assert_eq!(
            bed.manager.find_volume(id).await.unwrap().state,
            MountState::Mounted
        );
    }

    #[tokio::test]
    async fn unmount_of_unmounted_volume_is_a_precondition_error() {
        let bed = TestBed::started().await;
        let err = bed.manager.unmount(EMULATED_VOLUME_ID).await.unwrap_err();
        assert!(matches!(err, ServiceError::Precondition(_)));
        assert!(matches!(
            bed.manager.unmount("public:9,9").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn foreign_mount_below_volume_blocks_unmount() {
        let bed = TestBed::started().await;
        bed.add_usb_disk("sdb", 16).await;
        let id = "public:8,16";
        bed.manager.mount(id, MountFlag::Visible.into(), Some(0)).await.unwrap();

        let path = bed.volume_path(id).await;
        bed.mounts.insert_mount(&path.join("foreign"));

        let err = bed.manager.unmount(id).await.unwrap_err();
        assert!(err.is_busy());
        let info = bed.manager.find_volume(id).await.unwrap();
        assert_eq!(info.state, MountState::Mounted);
    }

    #[tokio::test]
    async fn shutdown_attempts_every_volume_and_reports_each_failure() {
        let bed = TestBed::started().await;
        for (name, minor) in [("sdb", 16), ("sdc", 32), ("sdd", 48), ("sde", 64)] {
            bed.add_usb_disk(name, minor).await;
        }
        let ids = ["public:8,16", "public:8,32", "public:8,48", "public:8,64"];
        for id in ids {
            bed.manager.mount(id, MountFlags::empty(), None).await.unwrap();
        }
        bed.mounts.set_busy(&bed.volume_path("public:8,32").await, true);
        bed.mounts.set_busy(&bed.volume_path("public:8,64").await, true);

        let err = bed.manager.shutdown().await.unwrap_err();
        match err {
            ServiceError::PartialFailure { operation, failed } => {
                assert_eq!(operation, "shutdown");
                assert_eq!(failed, vec!["public:8,32".to_string(), "public:8,64".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(bed.mounts.unmount_attempts(), 4);
        assert!(bed.manager.list_disks().await.is_empty());
        assert!(bed.manager.list_volumes(None).await.is_empty());
    }

    #[tokio::test]
    async fn unmount_all_keeps_the_model() {
        let bed = TestBed::started().await;
        bed.add_usb_disk("sdb", 16).await;
        bed.manager
            .mount("public:8,16", MountFlags::empty(), None)
            .await
            .unwrap();

        bed.manager.unmount_all().await.unwrap();
        let info = bed.manager.find_volume("public:8,16").await.unwrap();
        assert_eq!(info.state, MountState::Unmounted);
        assert_eq!(bed.manager.list_disks().await.len(), 1);
    }

    #[tokio::test]
    async fn reset_forgets_everything_but_leaves_mounts() {
        let bed = TestBed::started().await;
        bed.add_usb_disk("sdb", 16).await;
        bed.manager
            .mount("public:8,16", MountFlags::empty(), None)
            .await
            .unwrap();
        let path = bed.volume_path("public:8,16").await;

        bed.manager.reset().await.unwrap();
        assert!(bed.manager.list_disks().await.is_empty());
        assert!(bed.mounts.is_mounted_sync(&path));
        let volumes = bed.manager.list_volumes(None).await;
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].id, EMULATED_VOLUME_ID);

        // User 0 is gone too, so a new disk is deferred.
        bed.manager
            .handle_block_event(
                DeviceEvent::new(DeviceAction::Add, "/devices/pci0/usb1/block/sdc")
                    .with_attribute("MAJOR", "8")
                    .with_attribute("MINOR", "32")
                    .with_attribute("DEVTYPE", "disk"),
            )
            .await;
        assert!(bed.manager.find_disk("disk:8,32").await.unwrap().pending);
    }

    #[tokio::test]
    async fn mkdirs_requires_a_mounted_volume() {
        let bed = TestBed::started().await;
        let target = bed.config.paths.data_media.join("0/Download/file.txt");
        assert!(matches!(
            bed.manager.mkdirs(&target).await,
            Err(ServiceError::UnsafePath { .. })
        ));

        bed.manager
            .mount(EMULATED_VOLUME_ID, MountFlags::empty(), None)
            .await
            .unwrap();
        bed.manager.mkdirs(&target).await.unwrap();
        assert!(bed.config.paths.data_media.join("0/Download").is_dir());
        assert!(!target.exists());

        let escape = bed.config.paths.data_media.join("0/../../etc/");
        assert!(bed.manager.mkdirs(&escape).await.is_err());
    }

    #[tokio::test]
    async fn forget_partition_removes_the_key() {
        let bed = TestBed::started().await;
        let guid = "0f3e5c1a-0000-4000-8000-000000000001";
        let key = storage_sys::keys::key_path(&bed.config.paths.key_dir, guid).unwrap();
        std::fs::write(&key, [1u8; 64]).unwrap();

        bed.manager.forget_partition(guid, "f00d").await.unwrap();
        assert!(!key.exists());
        assert!(matches!(
            bed.manager.forget_partition(guid, "f00d").await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
