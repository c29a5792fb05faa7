// SPDX-License-Identifier: GPL-3.0-only

//! Storage visibility changes inside running processes

use storage_contracts::{MountAccess, RemountEntry};
use storage_types::{RemountMode, app_id_of, user_id_of};
use tracing::{debug, info, warn};

use super::{VolumeManager, batch_result};
use crate::error::{Result, ServiceError};

impl VolumeManager {
    /// Swap the per-package view of `uid` inside each of its processes
    ///
    /// `Default` keeps the access each process already has, falling back to
    /// the last mode applied to the package for processes without a view.
    pub async fn remount_uid(&self, uid: u32, mode: RemountMode) -> Result<()> {
        let mut state = self.state.lock().await;
        let user = user_id_of(uid);
        let app_id = app_id_of(uid);
        if !state.users.is_started(user) {
            return Err(ServiceError::precondition(format!("User {user} is not running")));
        }
        let package = state
            .users
            .packages_of(user)
            .iter()
            .find(|package| state.users.app_ids.get(*package) == Some(&app_id))
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("no package for uid {uid}")))?;

        let key = (user, package.clone());
        let fallback = state
            .users
            .package_modes
            .get(&key)
            .copied()
            .unwrap_or(RemountMode::Read);
        if mode != RemountMode::Default {
            state.users.package_modes.insert(key, mode);
        }

        let storage_root = &self.config.paths.storage_root;
        let pids = self.adapters.processes.pids_for_uid(uid).await?;
        info!("Remounting uid {} ({}) as {:?} in {} process(es)", uid, package, mode, pids.len());

        let mut failures = Vec::new();
        for pid in pids {
            let resolved = match mode {
                RemountMode::Default => {
                    match self.adapters.processes.mount_access(pid, storage_root).await {
                        Ok(MountAccess::ReadOnly) => RemountMode::Read,
                        Ok(MountAccess::ReadWrite) => RemountMode::Write,
                        Ok(MountAccess::Absent) => fallback,
                        Err(e) => {
                            warn!("Cannot read the view of pid {}: {}", pid, e);
                            failures.push((format!("pid {pid}"), ServiceError::from(e)));
                            continue;
                        }
                    }
                }
                other => other,
            };
            debug!("pid {} gets {:?}", pid, resolved);
            let entries = match resolved {
                RemountMode::None => vec![RemountEntry::Unmount {
                    target: storage_root.clone(),
                }],
                _ => vec![RemountEntry::Bind {
                    source: self.package_view(user, &package),
                    target: storage_root.clone(),
                    read_only: !resolved.is_writable(),
                }],
            };
            if let Err(e) = self.adapters.processes.remount_in_namespace(pid, &entries).await {
                warn!("Remount of pid {} failed: {}", pid, e);
                failures.push((format!("pid {pid}"), ServiceError::from(e)));
            }
        }
        batch_result("remountUid", failures)
    }

    /// Bind the shared runtime view for `mode` over the storage root
    pub async fn remount_uid_legacy(&self, uid: u32, mode: RemountMode) -> Result<()> {
        let _state = self.state.lock().await;
        let storage_root = self.config.paths.storage_root.clone();
        let entries = match mode.runtime_view() {
            None => vec![RemountEntry::Unmount { target: storage_root }],
            Some(view) => vec![RemountEntry::Bind {
                source: self.config.paths.runtime_root.join(view),
                target: storage_root,
                read_only: !mode.is_writable(),
            }],
        };
        info!("Legacy remount of uid {} as {:?}", uid, mode);
        self.remount_processes(uid, &entries).await
    }

    async fn remount_processes(&self, uid: u32, entries: &[RemountEntry]) -> Result<()> {
        let pids = self.adapters.processes.pids_for_uid(uid).await?;
        debug!("uid {} has {} process(es)", uid, pids.len());

        let mut failures = Vec::new();
        for pid in pids {
            if let Err(e) = self.adapters.processes.remount_in_namespace(pid, entries).await {
                warn!("Remount of pid {} failed: {}", pid, e);
                failures.push((format!("pid {pid}"), ServiceError::from(e)));
            }
        }
        batch_result("remountUid", failures)
    }
}
