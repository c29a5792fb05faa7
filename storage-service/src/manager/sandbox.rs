// SPDX-License-Identifier: GPL-3.0-only

//! Per-user, per-package sandbox trees below visible volumes
//!
//! Materialization is planned first, every path of the plan is validated
//! against the owning roots, and only then is anything created, chowned or
//! bind-mounted. Applying the same plan twice leaves the tree unchanged.

use std::path::{Path, PathBuf};

use storage_sys::validate_path;
use storage_types::{AppId, UserId, multiuser_uid};
use tracing::{debug, info, warn};

use super::state::ManagerState;
use super::volume::Volume;
use super::{VolumeManager, aggregate};
use crate::error::{Result, ServiceError};

/// Shared directories that receive a per-package subdirectory
const PACKAGE_DIRS: [&str; 3] = ["data", "media", "obb"];

/// One package bound to an app id and a sandbox id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub package: String,
    pub app_id: AppId,
    pub sandbox_id: String,
}

impl Binding {
    pub fn new(package: impl Into<String>, app_id: AppId, sandbox_id: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            app_id,
            sandbox_id: sandbox_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Dir {
        path: PathBuf,
        mode: u32,
        uid: u32,
        gid: u32,
    },
    Bind {
        source: PathBuf,
        target: PathBuf,
    },
}

/// Steps for one volume, validated against that volume's roots
#[derive(Debug, Default)]
struct Plan {
    roots: Vec<PathBuf>,
    steps: Vec<Step>,
}

impl Plan {
    fn dir(&mut self, path: PathBuf, mode: u32, uid: u32, gid: u32) {
        let step = Step::Dir { path, mode, uid, gid };
        if !self.steps.contains(&step) {
            self.steps.push(step);
        }
    }

    fn bind(&mut self, source: PathBuf, target: PathBuf) {
        self.steps.push(Step::Bind { source, target });
    }

    fn validate(&self) -> Result<()> {
        for step in &self.steps {
            match step {
                Step::Dir { path, .. } => {
                    validate_path(path, &self.roots)?;
                }
                Step::Bind { source, target } => {
                    validate_path(source, &self.roots)?;
                    validate_path(target, &self.roots)?;
                }
            }
        }
        Ok(())
    }
}

/// Reject package and sandbox names that could leave their parent directory
/// Kernel uid of `app_id` for `user`; ids past the uid space are rejected
pub fn app_uid(user: UserId, app_id: AppId) -> Result<u32> {
    multiuser_uid(user, app_id).ok_or_else(|| {
        ServiceError::InvalidArgument(format!("app {app_id} of user {user} has no valid uid"))
    })
}

pub fn check_name(kind: &str, name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0');
    if bad {
        return Err(ServiceError::InvalidArgument(format!("Bad {kind} name {name:?}")));
    }
    Ok(())
}

impl VolumeManager {
    /// Directory holding one view per volume for `package` of `user`
    pub(super) fn package_view(&self, user: UserId, package: &str) -> PathBuf {
        self.config
            .paths
            .user_root
            .join(user.to_string())
            .join("package")
            .join(package)
    }

    fn mount_target(&self, volume: &Volume, user: UserId, package: &str) -> PathBuf {
        self.package_view(user, package).join(volume.label())
    }

    fn volume_plan(&self, volume: &Volume, users: &[(UserId, Vec<Binding>)]) -> Result<Plan> {
        let Some(volume_path) = volume.path.clone() else {
            return Ok(Plan::default());
        };
        let mut plan = Plan {
            roots: vec![volume_path, self.config.paths.user_root.clone()],
            steps: Vec::new(),
        };

        let media_uid = self.config.media_rw_uid;
        let media_gid = self.config.media_rw_gid;
        for (user, bindings) in users {
            let Some(root) = volume.user_root(*user) else {
                continue;
            };
            if bindings.is_empty() {
                continue;
            }
            if volume.is_user_dependent() {
                plan.dir(root.clone(), 0o771, media_uid, media_gid);
            }
            let android = root.join("Android");
            plan.dir(android.clone(), 0o771, media_uid, media_gid);
            for dir in PACKAGE_DIRS.iter().chain(std::iter::once(&"sandbox")) {
                plan.dir(android.join(dir), 0o771, media_uid, media_gid);
            }

            let user_dir = self.config.paths.user_root.join(user.to_string());
            plan.dir(user_dir.clone(), 0o755, 0, 0);
            plan.dir(user_dir.join("package"), 0o755, 0, 0);

            for binding in bindings {
                check_name("package", &binding.package)?;
                check_name("sandbox", &binding.sandbox_id)?;
                let uid = app_uid(*user, binding.app_id)?;

                let source = android.join("sandbox").join(&binding.sandbox_id);
                plan.dir(source.clone(), 0o700, uid, uid);
                plan.dir(source.join("Android"), 0o700, uid, uid);
                for dir in PACKAGE_DIRS {
                    plan.dir(android.join(dir).join(&binding.package), 0o770, uid, media_gid);
                    plan.dir(source.join("Android").join(dir), 0o700, uid, uid);
                    plan.dir(
                        source.join("Android").join(dir).join(&binding.package),
                        0o700,
                        uid,
                        uid,
                    );
                }

                let target = self.mount_target(volume, *user, &binding.package);
                plan.dir(self.package_view(*user, &binding.package), 0o700, uid, uid);
                plan.dir(target.clone(), 0o700, uid, uid);
                plan.bind(source, target.clone());
                for dir in PACKAGE_DIRS {
                    plan.bind(
                        android.join(dir).join(&binding.package),
                        target.join("Android").join(dir).join(&binding.package),
                    );
                }
            }
        }
        Ok(plan)
    }

    async fn apply(&self, plan: &Plan) -> Result<()> {
        for step in &plan.steps {
            match step {
                Step::Dir { path, mode, uid, gid } => {
                    let status = storage_sys::ensure_dir(path, *mode)?;
                    if status.created {
                        debug!("Created {}", path.display());
                    }
                    let owner = self.adapters.ownership.owner(path).await?;
                    if owner != (*uid, *gid) {
                        self.adapters.ownership.set_owner(path, *uid, *gid).await?;
                    }
                }
                Step::Bind { source, target } => {
                    if !self.adapters.mounts.is_mounted(target).await? {
                        self.adapters.mounts.bind_mount(source, target, false).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate every plan before applying any of them
    async fn materialize(&self, plans: Vec<(String, Plan)>) -> Result<()> {
        for (_, plan) in &plans {
            plan.validate()?;
        }
        let mut failures = Vec::new();
        for (volume_id, plan) in &plans {
            if let Err(e) = self.apply(plan).await {
                warn!("Sandbox materialization on {} failed: {}", volume_id, e);
                failures.push((volume_id.clone(), e));
            }
        }
        aggregate("materialize", failures)
    }

    fn started_bindings(state: &ManagerState) -> Vec<(UserId, Vec<Binding>)> {
        state
            .users
            .started_users
            .iter()
            .map(|user| (*user, Self::user_bindings(state, *user)))
            .collect()
    }

    fn user_bindings(state: &ManagerState, user: UserId) -> Vec<Binding> {
        state
            .users
            .bound_packages(user)
            .into_iter()
            .map(|(package, app_id, sandbox_id)| Binding::new(package, app_id, sandbox_id))
            .collect()
    }

    fn visible_volumes(state: &ManagerState) -> Vec<&Volume> {
        state
            .visible_mounted()
            .iter()
            .filter_map(|id| state.volume(id))
            .collect()
    }

    /// Sandboxes of every started user on a freshly mounted volume
    pub(super) async fn materialize_volume(
        &self,
        state: &ManagerState,
        volume: &Volume,
    ) -> Result<()> {
        let plan = self.volume_plan(volume, &Self::started_bindings(state))?;
        self.materialize(vec![(volume.id.clone(), plan)]).await
    }

    /// Sandboxes of every package of `user` on every visible volume
    pub(super) async fn materialize_user(&self, state: &ManagerState, user: UserId) -> Result<()> {
        let users = vec![(user, Self::user_bindings(state, user))];
        let plans = Self::visible_volumes(state)
            .into_iter()
            .map(|volume| Ok((volume.id.clone(), self.volume_plan(volume, &users)?)))
            .collect::<Result<Vec<_>>>()?;
        self.materialize(plans).await
    }

    pub(super) async fn materialize_package(
        &self,
        state: &ManagerState,
        user: UserId,
        binding: &Binding,
    ) -> Result<()> {
        let users = vec![(user, vec![binding.clone()])];
        let plans = Self::visible_volumes(state)
            .into_iter()
            .map(|volume| Ok((volume.id.clone(), self.volume_plan(volume, &users)?)))
            .collect::<Result<Vec<_>>>()?;
        self.materialize(plans).await
    }

    /// Detach the bind mounts of one package view; directories stay
    async fn unmount_view(&self, target: &Path) -> Result<()> {
        let mut targets = self.adapters.mounts.mounts_under(target).await?;
        if self.adapters.mounts.is_mounted(target).await? {
            targets.push(target.to_path_buf());
        }
        for target in targets {
            self.adapters.mounts.unmount(&target, true).await?;
        }
        Ok(())
    }

    async fn teardown(&self, targets: Vec<PathBuf>) -> Result<()> {
        let mut failures = Vec::new();
        for target in targets {
            if let Err(e) = self.unmount_view(&target).await {
                warn!("Failed to tear down {}: {}", target.display(), e);
                failures.push((target.display().to_string(), e));
            }
        }
        aggregate("teardown", failures)
    }

    pub(super) async fn teardown_volume(
        &self,
        state: &ManagerState,
        volume: &Volume,
    ) -> Result<()> {
        let targets = state
            .users
            .started_users
            .iter()
            .flat_map(|user| {
                state
                    .users
                    .packages_of(*user)
                    .iter()
                    .map(move |package| self.mount_target(volume, *user, package))
            })
            .collect();
        self.teardown(targets).await
    }

    pub(super) async fn teardown_user(&self, state: &ManagerState, user: UserId) -> Result<()> {
        let targets = state
            .users
            .packages_of(user)
            .iter()
            .map(|package| self.package_view(user, package))
            .collect();
        self.teardown(targets).await
    }

    /// Unmount and delete the sandbox of one package
    pub(super) async fn destroy_package_sandbox(
        &self,
        state: &ManagerState,
        user: UserId,
        package: &str,
        sandbox_id: &str,
    ) -> Result<()> {
        check_name("package", package)?;
        check_name("sandbox", sandbox_id)?;
        let view = self.package_view(user, package);
        self.teardown(vec![view.clone()]).await?;

        let user_root = std::slice::from_ref(&self.config.paths.user_root);
        storage_sys::remove_tree(&view, user_root)?;

        let mut failures = Vec::new();
        for volume in Self::visible_volumes(state) {
            let (Some(root), Some(volume_path)) = (volume.user_root(user), volume.path.clone())
            else {
                continue;
            };
            let source = root.join("Android").join("sandbox").join(sandbox_id);
            if let Err(e) = storage_sys::remove_tree(&source, &[volume_path]) {
                failures.push((volume.id.clone(), e.into()));
            }
        }
        info!("Destroyed sandbox {} of {} for user {}", sandbox_id, package, user);
        aggregate("destroySandbox", failures)
    }
}
