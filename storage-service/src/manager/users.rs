// SPDX-License-Identifier: GPL-3.0-only

//! User lifecycle and package bindings

use storage_types::{AppId, UserId, is_valid_user_id};
use tracing::{info, warn};

use super::VolumeManager;
use super::sandbox::{Binding, check_name};
use super::state::ManagerState;
use crate::error::{Result, ServiceError};

fn check_lengths(what: &str, left: usize, right: usize) -> Result<()> {
    if left != right {
        return Err(ServiceError::InvalidArgument(format!(
            "{what}: {left} entries against {right}"
        )));
    }
    Ok(())
}

fn check_user(user: UserId) -> Result<()> {
    if !is_valid_user_id(user) {
        return Err(ServiceError::InvalidArgument(format!(
            "User id {user} is outside the uid space"
        )));
    }
    Ok(())
}

impl VolumeManager {
    pub async fn on_user_added(&self, user: UserId, serial: i32) -> Result<()> {
        check_user(user)?;
        let mut state = self.state.lock().await;
        state.users.added_users.insert(user, serial);
        info!("User {} added (serial {})", user, serial);
        Ok(())
    }

    pub async fn on_user_removed(&self, user: UserId) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.users.is_started(user) {
            return Err(ServiceError::precondition(format!("User {user} is still running")));
        }
        if state.users.added_users.remove(&user).is_none() {
            return Err(ServiceError::NotFound(format!("user {user}")));
        }
        state.users.user_packages.remove(&user);
        state.users.package_modes.retain(|(owner, _), _| *owner != user);
        info!("User {} removed", user);
        Ok(())
    }

    /// Register the bindings of `user`, then build its sandboxes on every visible volume
    pub async fn on_user_started(
        &self,
        user: UserId,
        packages: Vec<String>,
        app_ids: Vec<AppId>,
        sandbox_ids: Vec<String>,
    ) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.on_user_started_locked(&mut state, user, packages, app_ids, sandbox_ids)
                .await
        };
        self.notifier.flush();
        result
    }

    async fn on_user_started_locked(
        &self,
        state: &mut ManagerState,
        user: UserId,
        packages: Vec<String>,
        app_ids: Vec<AppId>,
        sandbox_ids: Vec<String>,
    ) -> Result<()> {
        check_user(user)?;
        if !state.users.added_users.contains_key(&user) {
            return Err(ServiceError::precondition(format!("User {user} was never added")));
        }
        check_lengths("appIds", packages.len(), app_ids.len())?;
        check_lengths("sandboxIds", packages.len(), sandbox_ids.len())?;
        for (package, sandbox_id) in packages.iter().zip(&sandbox_ids) {
            check_name("package", package)?;
            check_name("sandbox", sandbox_id)?;
        }

        for ((package, app_id), sandbox_id) in packages.iter().zip(app_ids).zip(sandbox_ids) {
            state.users.app_ids.insert(package.clone(), app_id);
            state.users.sandbox_ids.insert(app_id, sandbox_id);
        }
        state.users.user_packages.insert(user, packages);
        state.users.started_users.insert(user);
        info!("User {} started", user);

        if let Err(e) = self.link_primary(state, user) {
            warn!("Primary link for user {} failed: {}", user, e);
        }
        if user == 0 {
            self.flush_pending(state).await;
        }
        self.materialize_user(state, user).await
    }

    /// Detach the user's sandbox mounts; on-disk directories stay
    pub async fn on_user_stopped(&self, user: UserId) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.users.is_started(user) {
            return Err(ServiceError::precondition(format!("User {user} is not running")));
        }
        let result = self.teardown_user(&state, user).await;
        state.users.started_users.remove(&user);
        info!("User {} stopped", user);
        result
    }

    pub async fn add_app_ids(&self, packages: Vec<String>, app_ids: Vec<AppId>) -> Result<()> {
        check_lengths("appIds", packages.len(), app_ids.len())?;
        for package in &packages {
            check_name("package", package)?;
        }
        let mut state = self.state.lock().await;
        for (package, app_id) in packages.into_iter().zip(app_ids) {
            state.users.app_ids.insert(package, app_id);
        }
        Ok(())
    }

    pub async fn add_sandbox_ids(
        &self,
        app_ids: Vec<AppId>,
        sandbox_ids: Vec<String>,
    ) -> Result<()> {
        check_lengths("sandboxIds", app_ids.len(), sandbox_ids.len())?;
        for sandbox_id in &sandbox_ids {
            check_name("sandbox", sandbox_id)?;
        }
        let mut state = self.state.lock().await;
        for (app_id, sandbox_id) in app_ids.into_iter().zip(sandbox_ids) {
            state.users.sandbox_ids.insert(app_id, sandbox_id);
        }
        Ok(())
    }

    /// Bind a package installed while `user` runs and build its sandbox
    pub async fn prepare_sandbox_for_app(
        &self,
        package: &str,
        app_id: AppId,
        sandbox_id: &str,
        user: UserId,
    ) -> Result<()> {
        check_user(user)?;
        check_name("package", package)?;
        check_name("sandbox", sandbox_id)?;

        let mut state = self.state.lock().await;
        state.users.app_ids.insert(package.to_string(), app_id);
        state.users.sandbox_ids.insert(app_id, sandbox_id.to_string());
        let packages = state.users.user_packages.entry(user).or_default();
        if !packages.iter().any(|p| p == package) {
            packages.push(package.to_string());
        }

        if !state.users.is_started(user) {
            return Ok(());
        }
        self.materialize_package(&state, user, &Binding::new(package, app_id, sandbox_id))
            .await
    }

    pub async fn destroy_sandbox_for_app(
        &self,
        package: &str,
        sandbox_id: &str,
        user: UserId,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let result = self
            .destroy_package_sandbox(&state, user, package, sandbox_id)
            .await;
        if let Some(packages) = state.users.user_packages.get_mut(&user) {
            packages.retain(|p| p != package);
        }
        state.users.package_modes.remove(&(user, package.to_string()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::{TestBed, tree_snapshot};
    use std::os::unix::fs::{PermissionsExt, symlink};
    use storage_types::MountFlag;

    async fn bed_with_visible_volume() -> (TestBed, std::path::PathBuf) {
        let bed = TestBed::started().await;
        bed.add_usb_disk("sdb", 16).await;
        bed.manager
            .mount("public:8,16", MountFlag::Visible.into(), Some(0))
            .await
            .unwrap();
        let root = bed.volume_path("public:8,16").await;
        bed.manager.on_user_added(10, 10).await.unwrap();
        (bed, root)
    }

    async fn start_user_ten(bed: &TestBed) -> Result<()> {
        bed.manager
            .on_user_started(10, vec!["com.app".into()], vec![10123], vec!["sbx1".into()])
            .await
    }

    #[tokio::test]
    async fn starting_a_user_builds_package_sandboxes_once() {
        let (bed, root) = bed_with_visible_volume().await;
        start_user_ten(&bed).await.unwrap();

        let sandbox = root.join("Android/sandbox/sbx1");
        assert!(sandbox.is_dir());
        let mode = std::fs::metadata(&sandbox).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o700);
        assert_eq!(bed.ownership.owner_of(&sandbox), (1_010_123, 1_010_123));
        assert_eq!(
            bed.ownership.owner_of(&root.join("Android/data/com.app")),
            (1_010_123, 1023)
        );
        let target = bed.config.paths.user_root.join("10/package/com.app/UUID-8-16");
        assert!(bed.mounts.is_mounted_sync(&target));

        let volume_tree = tree_snapshot(&root);
        let user_tree = tree_snapshot(&bed.config.paths.user_root);
        let binds = bed.mounts.bind_count();
        let chowns = bed.ownership.changes();

        start_user_ten(&bed).await.unwrap();
        assert_eq!(tree_snapshot(&root), volume_tree);
        assert_eq!(tree_snapshot(&bed.config.paths.user_root), user_tree);
        assert_eq!(bed.mounts.bind_count(), binds);
        assert_eq!(bed.ownership.changes(), chowns);
    }

    #[tokio::test]
    async fn symlinked_volume_directory_is_rejected_before_any_change() {
        let (bed, root) = bed_with_visible_volume().await;
        let outside = tempfile::tempdir().unwrap();
        symlink(outside.path(), root.join("Android")).unwrap();

        let err = start_user_ten(&bed).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnsafePath { .. }));
        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
        assert!(!bed.config.paths.user_root.join("10").exists());
        assert_eq!(bed.mounts.bind_count(), 0);
        assert_eq!(bed.ownership.changes(), 0);
    }

    #[tokio::test]
    async fn dotted_package_names_are_rejected_without_registering() {
        let (bed, _root) = bed_with_visible_volume().await;
        let err = bed
            .manager
            .on_user_started(10, vec!["..".into()], vec![10123], vec!["sbx1".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        let err = bed
            .manager
            .on_user_started(10, vec!["com.app".into()], vec![], vec!["sbx1".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        assert!(bed.manager.on_user_removed(10).await.is_ok());
    }

    #[tokio::test]
    async fn starting_requires_an_added_user_and_removal_a_stopped_one() {
        let bed = TestBed::started().await;
        assert!(matches!(
            bed.manager.on_user_started(7, vec![], vec![], vec![]).await,
            Err(ServiceError::Precondition(_))
        ));
        assert!(matches!(
            bed.manager.on_user_removed(0).await,
            Err(ServiceError::Precondition(_))
        ));
        bed.manager.on_user_stopped(0).await.unwrap();
        bed.manager.on_user_removed(0).await.unwrap();
        assert!(matches!(
            bed.manager.on_user_removed(0).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stopping_detaches_mounts_but_keeps_directories() {
        let (bed, root) = bed_with_visible_volume().await;
        start_user_ten(&bed).await.unwrap();
        let target = bed.config.paths.user_root.join("10/package/com.app/UUID-8-16");

        bed.manager.on_user_stopped(10).await.unwrap();
        assert!(!bed.mounts.is_mounted_sync(&target));
        assert!(target.is_dir());
        assert!(root.join("Android/sandbox/sbx1").is_dir());
    }

    #[tokio::test]
    async fn late_installed_packages_get_and_lose_a_sandbox() {
        let (bed, root) = bed_with_visible_volume().await;
        start_user_ten(&bed).await.unwrap();

        bed.manager
            .prepare_sandbox_for_app("com.late", 10200, "sbx2", 10)
            .await
            .unwrap();
        let target = bed.config.paths.user_root.join("10/package/com.late/UUID-8-16");
        assert!(bed.mounts.is_mounted_sync(&target));
        assert!(root.join("Android/sandbox/sbx2").is_dir());

        bed.manager
            .destroy_sandbox_for_app("com.late", "sbx2", 10)
            .await
            .unwrap();
        assert!(!bed.mounts.is_mounted_sync(&target));
        assert!(!bed.config.paths.user_root.join("10/package/com.late").exists());
        assert!(!root.join("Android/sandbox/sbx2").exists());
        assert!(root.join("Android/sandbox/sbx1").is_dir());
    }

    #[tokio::test]
    async fn user_ids_past_the_uid_space_are_refused() {
        let (bed, root) = bed_with_visible_volume().await;
        let err = bed.manager.on_user_added(50_000, 1).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        let err = bed
            .manager
            .on_user_started(50_000, vec!["com.a".into()], vec![10123], vec!["s".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        let err = bed
            .manager
            .prepare_sandbox_for_app("com.a", 10123, "s", 50_000)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        assert!(!root.join("Android/sandbox/s").exists());

        // The manager keeps serving requests.
        start_user_ten(&bed).await.unwrap();
        assert!(root.join("Android/sandbox/sbx1").is_dir());
    }

    #[tokio::test]
    async fn id_tables_need_matching_lengths() {
        let bed = TestBed::started().await;
        assert!(bed.manager.add_app_ids(vec!["a".into()], vec![1, 2]).await.is_err());
        assert!(bed.manager.add_sandbox_ids(vec![1], vec![]).await.is_err());
        bed.manager.add_app_ids(vec!["a".into()], vec![1]).await.unwrap();
        bed.manager.add_sandbox_ids(vec![1], vec!["s".into()]).await.unwrap();
    }
}
