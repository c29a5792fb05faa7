// SPDX-License-Identifier: GPL-3.0-only

//! Collections guarded by the general state lock

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use storage_contracts::{LoopDevice, VolumeListener};
use storage_types::{AppId, RemountMode, UserId, VolumeEvent};

use super::disk::Disk;
use super::volume::Volume;

/// Users, packages and their app/sandbox bindings
#[derive(Debug, Default)]
pub struct UserRegistry {
    /// User id to serial number
    pub added_users: BTreeMap<UserId, i32>,
    pub started_users: BTreeSet<UserId>,
    pub user_packages: BTreeMap<UserId, Vec<String>>,
    pub app_ids: BTreeMap<String, AppId>,
    pub sandbox_ids: BTreeMap<AppId, String>,
    /// Last storage visibility applied to a package
    pub package_modes: BTreeMap<(UserId, String), RemountMode>,
}

impl UserRegistry {
    pub fn is_started(&self, user: UserId) -> bool {
        self.started_users.contains(&user)
    }

    pub fn packages_of(&self, user: UserId) -> &[String] {
        self.user_packages
            .get(&user)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolved `(package, app id, sandbox id)` for every package of `user`
    ///
    /// Packages without complete bindings are skipped.
    pub fn bound_packages(&self, user: UserId) -> Vec<(String, AppId, String)> {
        self.packages_of(user)
            .iter()
            .filter_map(|package| {
                let app_id = *self.app_ids.get(package)?;
                let sandbox_id = self.sandbox_ids.get(&app_id)?.clone();
                Some((package.clone(), app_id, sandbox_id))
            })
            .collect()
    }
}

/// Loop-backed disk created from an image in the key directory
#[derive(Debug, Clone)]
pub struct VirtualDisk {
    pub disk_id: String,
    pub image: PathBuf,
    pub loop_device: LoopDevice,
}

/// Everything the orchestrator owns
#[derive(Debug, Default)]
pub struct ManagerState {
    /// Live disks in creation order
    pub disks: Vec<Disk>,
    /// Disks seen while probing was deferred
    pub pending_disks: Vec<Disk>,
    pub volumes: BTreeMap<String, Volume>,
    pub users: UserRegistry,
    pub visible_volume_ids: BTreeSet<String>,
    pub primary: Option<String>,
    pub virtual_disk: Option<VirtualDisk>,
    pub virtual_disk_enabled: bool,
    pub secure_keyguard_showing: bool,
    pub started: bool,
    pub debug: bool,
    pub next_obb_id: u32,
    pub next_stub_id: u32,
}

impl ManagerState {
    pub fn find_disk(&self, id: &str) -> Option<&Disk> {
        self.disks.iter().find(|disk| disk.id == id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending_disks.iter().any(|disk| disk.id == id)
    }

    pub fn volume(&self, id: &str) -> Option<&Volume> {
        self.volumes.get(id)
    }

    /// Mounted volumes that expose per-user sandboxes
    pub fn visible_mounted(&self) -> Vec<String> {
        self.visible_volume_ids
            .iter()
            .filter(|id| {
                self.volumes
                    .get(*id)
                    .is_some_and(|volume| volume.state.is_mounted())
            })
            .cloned()
            .collect()
    }

    /// Paths of every mounted volume, used as roots for path validation
    pub fn mounted_roots(&self) -> Vec<PathBuf> {
        self.volumes
            .values()
            .filter(|volume| volume.state.is_mounted())
            .filter_map(|volume| volume.path.clone())
            .collect()
    }

    /// Whether probing must wait for the keyguard or user 0
    pub fn defers_disks(&self) -> bool {
        self.secure_keyguard_showing || !self.users.is_started(0)
    }
}

/// Listener outbox drained after the state lock is released
pub struct Notifier {
    outbox: Mutex<Vec<VolumeEvent>>,
    listener: Arc<dyn VolumeListener>,
}

impl Notifier {
    pub fn new(listener: Arc<dyn VolumeListener>) -> Self {
        Self {
            outbox: Mutex::new(Vec::new()),
            listener,
        }
    }

    pub fn push(&self, event: VolumeEvent) {
        self.outbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    pub fn flush(&self) {
        let events = std::mem::take(
            &mut *self
                .outbox
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for event in events {
            self.listener.notify(event);
        }
    }
}
