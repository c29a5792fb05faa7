// SPDX-License-Identifier: GPL-3.0-only

//! Volume variants and the shared mount state machine
//!
//! Each variant implements [`VolumeDriver`] with only the mount and unmount
//! hooks it needs; [`Volume`] owns the state transitions and the notifications
//! that go with them.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use storage_contracts::{FsMetadata, KeyBuffer, LoopDevice, MountRequest};
use storage_sys::keys::normalize_hex;
use storage_sys::prepare_dir;
use storage_types::{
    MountFlag, MountFlags, MountState, UserId, VolumeEvent, VolumeInfo, VolumeType,
};
use tracing::{info, warn};

use super::MountEnv;
use super::state::Notifier;
use crate::error::{Result, ServiceError};

/// What a successful mount produced
#[derive(Debug, Default)]
pub struct Mounted {
    pub internal_path: Option<PathBuf>,
    pub path: Option<PathBuf>,
    pub metadata: Option<FsMetadata>,
    pub read_only: bool,
}

impl Mounted {
    fn at(path: PathBuf) -> Self {
        Self {
            internal_path: Some(path.clone()),
            path: Some(path),
            ..Self::default()
        }
    }
}

/// Mount and unmount hooks of one volume variant
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    fn volume_type(&self) -> VolumeType;

    /// Whether per-user roots live below the volume path
    fn is_user_dependent(&self) -> bool {
        false
    }

    async fn do_mount(&mut self, id: &str, env: &MountEnv<'_>) -> Result<Mounted>;

    async fn do_unmount(&mut self, internal_path: Option<&Path>, env: &MountEnv<'_>) -> Result<()>;
}

/// Directory name a volume is mounted under
pub fn stable_name(id: &str, fs_uuid: &str) -> String {
    if fs_uuid.is_empty() {
        id.replace([':', ','], "_")
    } else {
        fs_uuid.to_string()
    }
}

fn vfat_options(uid: u32, gid: u32, mask: &str) -> String {
    format!("uid={uid},gid={gid},fmask={mask},dmask={mask},shortname=mixed,utf8")
}

async fn probe_filesystem(
    device: &Path,
    major: u32,
    minor: u32,
    env: &MountEnv<'_>,
) -> Result<FsMetadata> {
    env.adapters
        .probe
        .read_fs_metadata(device, major, minor)
        .await
        .map_err(|e| {
            ServiceError::OperationFailed(format!(
                "No filesystem on {}: {}",
                device.display(),
                e.message
            ))
        })
}

async fn check_and_mount(request: MountRequest, env: &MountEnv<'_>) -> Result<()> {
    env.adapters
        .mounts
        .check_filesystem(&request.device, &request.fs_type)
        .await
        .map_err(|e| {
            ServiceError::OperationFailed(format!(
                "Filesystem check failed on {}: {}",
                request.device.display(),
                e.message
            ))
        })?;
    env.adapters.mounts.mount_filesystem(&request).await?;
    Ok(())
}

async fn unmount_and_remove(target: &Path, detach: bool, env: &MountEnv<'_>) -> Result<()> {
    env.adapters.mounts.unmount(target, detach).await?;
    if let Err(e) = std::fs::remove_dir(target) {
        warn!("Failed to remove mount point {}: {}", target.display(), e);
    }
    Ok(())
}

/// Portable media mounted directly below the media_rw root
#[derive(Debug)]
pub struct PublicVolume {
    pub device: PathBuf,
    pub major: u32,
    pub minor: u32,
}

#[async_trait]
impl VolumeDriver for PublicVolume {
    fn volume_type(&self) -> VolumeType {
        VolumeType::Public
    }

    async fn do_mount(&mut self, id: &str, env: &MountEnv<'_>) -> Result<Mounted> {
        let metadata = probe_filesystem(&self.device, self.major, self.minor, env).await?;
        let options = match metadata.fs_type.as_str() {
            "vfat" | "exfat" => {
                vfat_options(env.config.media_rw_uid, env.config.media_rw_gid, "0007")
            }
            other => {
                return Err(ServiceError::Unsupported(format!(
                    "{other} on public volume {id}"
                )));
            }
        };

        let root = &env.config.paths.media_rw_root;
        let target = root.join(stable_name(id, &metadata.fs_uuid));
        prepare_dir(&target, 0o700, std::slice::from_ref(root))?;

        check_and_mount(
            MountRequest {
                device: self.device.clone(),
                target: target.clone(),
                fs_type: metadata.fs_type.clone(),
                read_only: false,
                options,
            },
            env,
        )
        .await?;

        Ok(Mounted {
            metadata: Some(metadata),
            ..Mounted::at(target)
        })
    }

    async fn do_unmount(&mut self, internal_path: Option<&Path>, env: &MountEnv<'_>) -> Result<()> {
        match internal_path {
            Some(target) => unmount_and_remove(target, false, env).await,
            None => Ok(()),
        }
    }
}

/// Adopted media encrypted with a per-partition key
pub struct PrivateVolume {
    pub device: PathBuf,
    pub major: u32,
    pub minor: u32,
    pub part_guid: String,
    pub key: Option<KeyBuffer>,
    key_ref: Option<String>,
}

impl std::fmt::Debug for PrivateVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateVolume")
            .field("device", &self.device)
            .field("part_guid", &self.part_guid)
            .field("has_key", &self.key.is_some())
            .field("key_installed", &self.key_ref.is_some())
            .finish()
    }
}

impl PrivateVolume {
    pub fn new(
        device: PathBuf,
        major: u32,
        minor: u32,
        part_guid: String,
        key: Option<KeyBuffer>,
    ) -> Self {
        Self {
            device,
            major,
            minor,
            part_guid,
            key,
            key_ref: None,
        }
    }
}

#[async_trait]
impl VolumeDriver for PrivateVolume {
    fn volume_type(&self) -> VolumeType {
        VolumeType::Private
    }

    async fn do_mount(&mut self, id: &str, env: &MountEnv<'_>) -> Result<Mounted> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| ServiceError::precondition(format!("No key for {id}")))?;

        let metadata = probe_filesystem(&self.device, self.major, self.minor, env).await?;
        if !matches!(metadata.fs_type.as_str(), "ext4" | "f2fs") {
            return Err(ServiceError::Unsupported(format!(
                "{} on private volume {id}",
                metadata.fs_type
            )));
        }

        let name = if metadata.fs_uuid.is_empty() {
            normalize_hex(&self.part_guid)?
        } else {
            metadata.fs_uuid.clone()
        };
        let root = &env.config.paths.expand_root;
        let target = root.join(name);
        prepare_dir(&target, 0o700, std::slice::from_ref(root))?;

        check_and_mount(
            MountRequest {
                device: self.device.clone(),
                target: target.clone(),
                fs_type: metadata.fs_type.clone(),
                read_only: false,
                options: String::new(),
            },
            env,
        )
        .await?;

        match env.crypt.install(key, &target).await {
            Ok(raw_ref) => self.key_ref = Some(raw_ref),
            Err(e) => {
                if let Err(unmount_err) = env.adapters.mounts.unmount(&target, true).await {
                    warn!("Failed to roll back mount of {}: {}", id, unmount_err);
                }
                return Err(e);
            }
        }

        Ok(Mounted {
            metadata: Some(metadata),
            ..Mounted::at(target)
        })
    }

    async fn do_unmount(&mut self, internal_path: Option<&Path>, env: &MountEnv<'_>) -> Result<()> {
        let Some(target) = internal_path else {
            return Ok(());
        };
        if let Some(raw_ref) = self.key_ref.take() {
            match env.crypt.evict(target, &raw_ref).await {
                Ok(()) => {}
                Err(e) if e.is_busy() => {
                    self.key_ref = Some(raw_ref);
                    return Err(e);
                }
                Err(e) => warn!("Key eviction for {} failed: {}", target.display(), e),
            }
        }
        unmount_and_remove(target, false, env).await
    }
}

/// Directory-backed internal storage
#[derive(Debug)]
pub struct EmulatedVolume {
    pub source: PathBuf,
}

#[async_trait]
impl VolumeDriver for EmulatedVolume {
    fn volume_type(&self) -> VolumeType {
        VolumeType::Emulated
    }

    fn is_user_dependent(&self) -> bool {
        true
    }

    async fn do_mount(&mut self, _id: &str, _env: &MountEnv<'_>) -> Result<Mounted> {
        storage_sys::ensure_dir(&self.source, 0o771)?;
        Ok(Mounted::at(self.source.clone()))
    }

    async fn do_unmount(
        &mut self,
        _internal_path: Option<&Path>,
        _env: &MountEnv<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Filesystem mounted by someone else and surfaced as a volume
#[derive(Debug)]
pub struct StubVolume {
    pub source: PathBuf,
    pub mount_path: PathBuf,
}

#[async_trait]
impl VolumeDriver for StubVolume {
    fn volume_type(&self) -> VolumeType {
        VolumeType::Stub
    }

    async fn do_mount(&mut self, _id: &str, _env: &MountEnv<'_>) -> Result<Mounted> {
        Ok(Mounted {
            internal_path: Some(self.source.clone()),
            path: Some(self.mount_path.clone()),
            ..Mounted::default()
        })
    }

    async fn do_unmount(
        &mut self,
        _internal_path: Option<&Path>,
        _env: &MountEnv<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Loop-mounted application archive
#[derive(Debug)]
pub struct ObbVolume {
    pub image: PathBuf,
    pub owner_gid: u32,
    pub number: u32,
    loop_device: Option<LoopDevice>,
}

impl ObbVolume {
    pub fn new(image: PathBuf, owner_gid: u32, number: u32) -> Self {
        Self {
            image,
            owner_gid,
            number,
            loop_device: None,
        }
    }
}

#[async_trait]
impl VolumeDriver for ObbVolume {
    fn volume_type(&self) -> VolumeType {
        VolumeType::Obb
    }

    async fn do_mount(&mut self, _id: &str, env: &MountEnv<'_>) -> Result<Mounted> {
        let root = &env.config.paths.obb_root;
        let target = root.join(self.number.to_string());
        prepare_dir(&target, 0o700, std::slice::from_ref(root))?;

        let loop_device = env.adapters.mounts.attach_loop(&self.image).await?;
        let request = MountRequest {
            device: loop_device.path.clone(),
            target: target.clone(),
            fs_type: "vfat".to_string(),
            read_only: true,
            options: vfat_options(0, self.owner_gid, "0227"),
        };
        if let Err(e) = env.adapters.mounts.mount_filesystem(&request).await {
            if let Err(detach_err) = env.adapters.mounts.detach_loop(&loop_device.path).await {
                warn!("Failed to detach {}: {}", loop_device.path.display(), detach_err);
            }
            return Err(e.into());
        }
        self.loop_device = Some(loop_device);

        Ok(Mounted {
            metadata: Some(FsMetadata {
                fs_type: "vfat".to_string(),
                ..FsMetadata::default()
            }),
            read_only: true,
            ..Mounted::at(target)
        })
    }

    async fn do_unmount(&mut self, internal_path: Option<&Path>, env: &MountEnv<'_>) -> Result<()> {
        if let Some(target) = internal_path {
            unmount_and_remove(target, false, env).await?;
        }
        if let Some(loop_device) = self.loop_device.take() {
            if let Err(e) = env.adapters.mounts.detach_loop(&loop_device.path).await {
                warn!("Failed to detach {}: {}", loop_device.path.display(), e);
            }
        }
        Ok(())
    }
}

/// Per-application FUSE session
#[derive(Debug)]
pub struct AppFuseVolume {
    pub uid: u32,
    pub mount_id: u32,
    device: Option<OwnedFd>,
}

impl AppFuseVolume {
    pub fn new(uid: u32, mount_id: u32) -> Self {
        Self {
            uid,
            mount_id,
            device: None,
        }
    }

    pub fn mount_point(&self, appfuse_root: &Path) -> PathBuf {
        appfuse_root.join(format!("{}_{}", self.uid, self.mount_id))
    }

    /// Hand the FUSE device descriptor to the caller
    pub fn take_device(&mut self) -> Option<OwnedFd> {
        self.device.take()
    }
}

#[async_trait]
impl VolumeDriver for AppFuseVolume {
    fn volume_type(&self) -> VolumeType {
        VolumeType::AppFuse
    }

    async fn do_mount(&mut self, _id: &str, env: &MountEnv<'_>) -> Result<Mounted> {
        let root = &env.config.paths.appfuse_root;
        let target = self.mount_point(root);
        prepare_dir(&target, 0o700, std::slice::from_ref(root))?;
        self.device = Some(env.adapters.mounts.mount_fuse(&target, self.uid).await?);
        Ok(Mounted::at(target))
    }

    async fn do_unmount(&mut self, internal_path: Option<&Path>, env: &MountEnv<'_>) -> Result<()> {
        self.device = None;
        match internal_path {
            Some(target) => unmount_and_remove(target, true, env).await,
            None => Ok(()),
        }
    }
}

/// Closed set of volume variants
#[derive(Debug)]
pub enum VolumeKind {
    Public(PublicVolume),
    Private(PrivateVolume),
    Emulated(EmulatedVolume),
    Stub(StubVolume),
    Obb(ObbVolume),
    AppFuse(AppFuseVolume),
}

impl VolumeKind {
    pub fn driver(&self) -> &dyn VolumeDriver {
        match self {
            Self::Public(v) => v,
            Self::Private(v) => v,
            Self::Emulated(v) => v,
            Self::Stub(v) => v,
            Self::Obb(v) => v,
            Self::AppFuse(v) => v,
        }
    }

    pub fn driver_mut(&mut self) -> &mut dyn VolumeDriver {
        match self {
            Self::Public(v) => v,
            Self::Private(v) => v,
            Self::Emulated(v) => v,
            Self::Stub(v) => v,
            Self::Obb(v) => v,
            Self::AppFuse(v) => v,
        }
    }
}

/// One mountable unit and its state machine
#[derive(Debug)]
pub struct Volume {
    pub id: String,
    pub kind: VolumeKind,
    pub disk_id: Option<String>,
    pub part_guid: Option<String>,
    pub state: MountState,
    pub mount_flags: MountFlags,
    pub mount_user_id: Option<UserId>,
    pub fs_type: String,
    pub fs_uuid: String,
    pub fs_label: String,
    pub internal_path: Option<PathBuf>,
    pub path: Option<PathBuf>,
}

fn path_string(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.display().to_string())
}

impl Volume {
    pub fn new(id: impl Into<String>, kind: VolumeKind, disk_id: Option<String>) -> Self {
        let part_guid = match &kind {
            VolumeKind::Private(private) => Some(private.part_guid.clone()),
            _ => None,
        };
        Self {
            id: id.into(),
            kind,
            disk_id,
            part_guid,
            state: MountState::Unmounted,
            mount_flags: MountFlags::empty(),
            mount_user_id: None,
            fs_type: String::new(),
            fs_uuid: String::new(),
            fs_label: String::new(),
            internal_path: None,
            path: None,
        }
    }

    pub fn volume_type(&self) -> VolumeType {
        self.kind.driver().volume_type()
    }

    pub fn is_user_dependent(&self) -> bool {
        self.kind.driver().is_user_dependent()
    }

    pub fn is_visible(&self) -> bool {
        self.mount_flags.contains(MountFlag::Visible)
    }

    /// Name used for this volume inside per-package sandboxes
    pub fn label(&self) -> String {
        match self.volume_type() {
            VolumeType::Emulated => "emulated".to_string(),
            _ => stable_name(&self.id, &self.fs_uuid),
        }
    }

    /// Root `user` sees on this volume
    pub fn user_root(&self, user: UserId) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        Some(if self.is_user_dependent() {
            path.join(user.to_string())
        } else {
            path.clone()
        })
    }

    pub fn created_event(&self) -> VolumeEvent {
        VolumeEvent::VolumeCreated {
            volume_id: self.id.clone(),
            volume_type: self.volume_type(),
            disk_id: self.disk_id.clone(),
            part_guid: self.part_guid.clone(),
        }
    }

    pub fn set_state(&mut self, new: MountState, notifier: &Notifier) {
        let old = std::mem::replace(&mut self.state, new);
        if old != new {
            info!("Volume {}: {} -> {}", self.id, old, new);
            notifier.push(VolumeEvent::VolumeStateChanged {
                volume_id: self.id.clone(),
                old,
                new,
            });
        }
    }

    pub fn set_metadata(&mut self, metadata: FsMetadata, notifier: &Notifier) {
        self.fs_type = metadata.fs_type;
        self.fs_uuid = metadata.fs_uuid;
        self.fs_label = metadata.fs_label;
        notifier.push(VolumeEvent::VolumeMetadataChanged {
            volume_id: self.id.clone(),
            fs_type: self.fs_type.clone(),
            fs_uuid: self.fs_uuid.clone(),
            fs_label: self.fs_label.clone(),
        });
    }

    fn set_paths(
        &mut self,
        internal_path: Option<PathBuf>,
        path: Option<PathBuf>,
        notifier: &Notifier,
    ) {
        if self.internal_path != internal_path {
            self.internal_path = internal_path;
            notifier.push(VolumeEvent::VolumeInternalPathChanged {
                volume_id: self.id.clone(),
                path: path_string(&self.internal_path),
            });
        }
        if self.path != path {
            self.path = path;
            notifier.push(VolumeEvent::VolumePathChanged {
                volume_id: self.id.clone(),
                path: path_string(&self.path),
            });
        }
    }

    /// Drive `Unmounted → Checking → Mounted`, or land in `Unmountable`
    pub async fn mount(&mut self, env: &MountEnv<'_>, notifier: &Notifier) -> Result<()> {
        if !self.state.can_mount() {
            return Err(ServiceError::precondition(format!(
                "Volume {} is {}",
                self.id, self.state
            )));
        }
        if let VolumeKind::Private(private) = &self.kind {
            if private.key.is_none() {
                return Err(ServiceError::precondition(format!(
                    "No key available for {}",
                    self.id
                )));
            }
        }

        self.set_state(MountState::Checking, notifier);
        let id = self.id.clone();
        match self.kind.driver_mut().do_mount(&id, env).await {
            Ok(mounted) => {
                if let Some(metadata) = mounted.metadata {
                    self.set_metadata(metadata, notifier);
                }
                self.set_paths(mounted.internal_path, mounted.path, notifier);
                let state = if mounted.read_only {
                    MountState::MountedReadOnly
                } else {
                    MountState::Mounted
                };
                self.set_state(state, notifier);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to mount {}: {}", self.id, e);
                self.set_state(MountState::Unmountable, notifier);
                Err(e)
            }
        }
    }

    /// Drive `Mounted → Unmounting → Unmounted`
    ///
    /// A busy mount restores the previous mounted state; any other failure
    /// lands in `Unmountable`.
    pub async fn unmount(&mut self, env: &MountEnv<'_>, notifier: &Notifier) -> Result<()> {
        if !self.state.is_mounted() {
            return Err(ServiceError::precondition(format!(
                "Volume {} is {}",
                self.id, self.state
            )));
        }

        let previous = self.state;
        self.set_state(MountState::Unmounting, notifier);
        let internal_path = self.internal_path.clone();
        match self.kind.driver_mut().do_unmount(internal_path.as_deref(), env).await {
            Ok(()) => {
                self.set_paths(None, None, notifier);
                self.set_state(MountState::Unmounted, notifier);
                Ok(())
            }
            Err(e) if e.is_busy() => {
                self.set_state(previous, notifier);
                Err(e)
            }
            Err(e) => {
                warn!("Failed to unmount {}: {}", self.id, e);
                self.set_state(MountState::Unmountable, notifier);
                Err(e)
            }
        }
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            id: self.id.clone(),
            volume_type: self.volume_type(),
            disk_id: self.disk_id.clone(),
            part_guid: self.part_guid.clone(),
            state: self.state,
            mount_flags: self.mount_flags,
            mount_user_id: self.mount_user_id,
            fs_type: self.fs_type.clone(),
            fs_uuid: self.fs_uuid.clone(),
            fs_label: self.fs_label.clone(),
            internal_path: path_string(&self.internal_path),
            path: path_string(&self.path),
        }
    }
}
