// SPDX-License-Identifier: GPL-3.0-only

//! Primary volume selection and the per-user entry-point links

use std::path::Path;

use storage_types::UserId;
use tracing::{info, warn};

use super::state::ManagerState;
use super::{VolumeManager, batch_result};
use crate::error::{Result, ServiceError};

const PRIMARY_LINK: &str = "primary";

impl VolumeManager {
    pub async fn set_primary(&self, volume_id: &str) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.set_primary_locked(&mut state, volume_id).await
        };
        self.notifier.flush();
        result
    }

    /// Rebind every started user to `volume_id`, or leave the old primary in place
    pub(super) async fn set_primary_locked(
        &self,
        state: &mut ManagerState,
        volume_id: &str,
    ) -> Result<()> {
        let volume = state
            .volume(volume_id)
            .ok_or_else(|| ServiceError::NotFound(format!("volume {volume_id}")))?;
        if !volume.state.is_mounted() {
            return Err(ServiceError::precondition(format!(
                "Volume {volume_id} is {}",
                volume.state
            )));
        }
        if state.primary.as_deref() == Some(volume_id) {
            return Ok(());
        }

        let mut linked = Vec::new();
        let mut failures = Vec::new();
        for user in state.users.started_users.iter().copied() {
            let Some(target) = volume.user_root(user) else {
                continue;
            };
            match self.link_user(user, &target) {
                Ok(()) => linked.push(user),
                Err(e) => {
                    warn!("Failed to rebind primary for user {}: {}", user, e);
                    failures.push((format!("user {user}"), e));
                }
            }
        }

        if !failures.is_empty() {
            for user in linked {
                if let Err(e) = self.restore_link(state, user) {
                    warn!("Failed to restore primary link of user {}: {}", user, e);
                }
            }
            return batch_result("setPrimary", failures);
        }

        info!("Primary volume is now {}", volume_id);
        state.primary = Some(volume_id.to_string());
        Ok(())
    }

    fn link_user(&self, user: UserId, target: &Path) -> Result<()> {
        let user_root = &self.config.paths.user_root;
        let roots = std::slice::from_ref(user_root);
        let dir = user_root.join(user.to_string());
        storage_sys::prepare_dir(&dir, 0o755, roots)?;
        storage_sys::replace_symlink(&dir.join(PRIMARY_LINK), target, roots)?;
        Ok(())
    }

    /// Point the link of `user` back at the current primary, or drop it
    fn restore_link(&self, state: &ManagerState, user: UserId) -> Result<()> {
        let current = state
            .primary
            .as_deref()
            .and_then(|id| state.volume(id))
            .and_then(|volume| volume.user_root(user));
        match current {
            Some(target) => self.link_user(user, &target),
            None => {
                let link = self
                    .config
                    .paths
                    .user_root
                    .join(user.to_string())
                    .join(PRIMARY_LINK);
                match std::fs::symlink_metadata(&link) {
                    Ok(metadata) if metadata.file_type().is_symlink() => {
                        std::fs::remove_file(&link).map_err(|e| {
                            ServiceError::OperationFailed(format!("{}: {e}", link.display()))
                        })
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Forget `volume_id` as primary and drop the links of every started user
    pub(super) fn clear_primary(&self, state: &mut ManagerState, volume_id: &str) {
        if state.primary.as_deref() != Some(volume_id) {
            return;
        }
        info!("Primary volume {} is gone", volume_id);
        state.primary = None;
        for user in state.users.started_users.iter().copied() {
            if let Err(e) = self.restore_link(state, user) {
                warn!("Failed to drop primary link of user {}: {}", user, e);
            }
        }
    }

    /// Link a newly started user to the current primary, if any
    pub(super) fn link_primary(&self, state: &ManagerState, user: UserId) -> Result<()> {
        let target = state
            .primary
            .as_deref()
            .and_then(|id| state.volume(id))
            .and_then(|volume| volume.user_root(user));
        match target {
            Some(target) => self.link_user(user, &target),
            None => Ok(()),
        }
    }
}
