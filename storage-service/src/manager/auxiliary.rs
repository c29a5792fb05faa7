// SPDX-License-Identifier: GPL-3.0-only

//! OBB, stub and app-fuse volumes that have no backing disk

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use storage_contracts::FsMetadata;
use storage_types::{MountFlags, VolumeType};
use tracing::{info, warn};

use super::VolumeManager;
use super::state::ManagerState;
use super::volume::{AppFuseVolume, ObbVolume, StubVolume, Volume, VolumeKind};
use crate::error::{Result, ServiceError};

fn require_absolute(what: &str, path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(ServiceError::InvalidArgument(format!(
            "{what} {} is not absolute",
            path.display()
        )));
    }
    Ok(())
}

fn app_fuse_id(uid: u32, mount_id: u32) -> String {
    format!("appfuse:{uid},{mount_id}")
}

impl VolumeManager {
    /// Register `volume` and mount it; a volume that fails to mount is dropped again
    async fn add_and_mount(&self, state: &mut ManagerState, volume: Volume) -> Result<String> {
        let id = volume.id.clone();
        self.notifier.push(volume.created_event());
        state.volumes.insert(id.clone(), volume);

        if let Err(e) = self.mount_locked(state, &id, MountFlags::empty(), None).await {
            if let Some(volume) = state.volumes.remove(&id) {
                self.discard_volume(state, volume);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Unmount (when mounted) and forget a standalone volume of `volume_type`
    async fn remove_standalone(
        &self,
        state: &mut ManagerState,
        volume_id: &str,
        volume_type: VolumeType,
    ) -> Result<()> {
        let volume = state
            .volume(volume_id)
            .filter(|volume| volume.volume_type() == volume_type)
            .ok_or_else(|| ServiceError::NotFound(format!("{volume_type} volume {volume_id}")))?;
        if volume.state.is_mounted() {
            self.unmount_locked(state, volume_id).await?;
        }
        if let Some(volume) = state.volumes.remove(volume_id) {
            self.discard_volume(state, volume);
        }
        Ok(())
    }

    /// Loop-mount an application archive read-only and return its volume id
    pub async fn create_obb(&self, image: &Path, key: &str, owner_gid: u32) -> Result<String> {
        require_absolute("OBB image", image)?;
        if !key.is_empty() {
            return Err(ServiceError::Unsupported("encrypted OBB images".to_string()));
        }

        let result = {
            let mut state = self.state.lock().await;
            let number = state.next_obb_id;
            state.next_obb_id += 1;
            let volume = Volume::new(
                format!("obb:{number}"),
                VolumeKind::Obb(ObbVolume::new(image.to_path_buf(), owner_gid, number)),
                None,
            );
            self.add_and_mount(&mut state, volume).await
        };
        self.notifier.flush();
        if let Ok(id) = &result {
            info!("Mounted OBB {} as {}", image.display(), id);
        }
        result
    }

    pub async fn destroy_obb(&self, volume_id: &str) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.remove_standalone(&mut state, volume_id, VolumeType::Obb).await
        };
        self.notifier.flush();
        result
    }

    /// Surface a filesystem mounted elsewhere; returns the new volume id
    pub async fn create_stub_volume(
        &self,
        source: &Path,
        mount_path: &Path,
        fs_type: &str,
        fs_uuid: &str,
        fs_label: &str,
    ) -> Result<String> {
        require_absolute("Stub source", source)?;
        require_absolute("Stub mount path", mount_path)?;

        let id = {
            let mut state = self.state.lock().await;
            let number = state.next_stub_id;
            state.next_stub_id += 1;
            let mut volume = Volume::new(
                format!("stub:{number}"),
                VolumeKind::Stub(StubVolume {
                    source: source.to_path_buf(),
                    mount_path: mount_path.to_path_buf(),
                }),
                None,
            );
            self.notifier.push(volume.created_event());
            volume.set_metadata(
                FsMetadata {
                    fs_type: fs_type.to_string(),
                    fs_uuid: fs_uuid.to_string(),
                    fs_label: fs_label.to_string(),
                },
                &self.notifier,
            );
            let id = volume.id.clone();
            state.volumes.insert(id.clone(), volume);
            id
        };
        self.notifier.flush();
        info!("Created stub volume {} for {}", id, source.display());
        Ok(id)
    }

    pub async fn destroy_stub_volume(&self, volume_id: &str) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            self.remove_standalone(&mut state, volume_id, VolumeType::Stub).await
        };
        self.notifier.flush();
        result
    }

    /// Start a FUSE session for `(uid, mount_id)` and hand back its device descriptor
    pub async fn mount_app_fuse(&self, uid: u32, mount_id: u32) -> Result<OwnedFd> {
        let result = {
            let mut state = self.state.lock().await;
            self.mount_app_fuse_locked(&mut state, uid, mount_id).await
        };
        self.notifier.flush();
        result
    }

    async fn mount_app_fuse_locked(
        &self,
        state: &mut ManagerState,
        uid: u32,
        mount_id: u32,
    ) -> Result<OwnedFd> {
        let id = app_fuse_id(uid, mount_id);
        if state.volumes.contains_key(&id) {
            return Err(ServiceError::AlreadyExists(format!("app-fuse slot {uid}/{mount_id}")));
        }

        let volume = Volume::new(id, VolumeKind::AppFuse(AppFuseVolume::new(uid, mount_id)), None);
        let id = self.add_and_mount(state, volume).await?;
        let device = match state.volumes.get_mut(&id).map(|volume| &mut volume.kind) {
            Some(VolumeKind::AppFuse(app_fuse)) => app_fuse.take_device(),
            _ => None,
        };
        device.ok_or_else(|| ServiceError::OperationFailed(format!("{id} has no FUSE device")))
    }

    /// Release the slot of `(uid, mount_id)`; an empty slot is not an error
    pub async fn unmount_app_fuse(&self, uid: u32, mount_id: u32) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            let id = app_fuse_id(uid, mount_id);
            if state.volumes.contains_key(&id) {
                self.remove_standalone(&mut state, &id, VolumeType::AppFuse).await
            } else {
                warn!("App-fuse slot {} already released", id);
                Ok(())
            }
        };
        self.notifier.flush();
        result
    }

    /// Open `file_id` inside a mounted app-fuse session with raw open `flags`
    pub async fn open_app_fuse_file(
        &self,
        uid: u32,
        mount_id: u32,
        file_id: u32,
        flags: i32,
    ) -> Result<OwnedFd> {
        let path = {
            let state = self.state.lock().await;
            let id = app_fuse_id(uid, mount_id);
            let volume = state
                .volume(&id)
                .filter(|volume| volume.state.is_mounted())
                .ok_or_else(|| ServiceError::NotFound(format!("mounted app-fuse slot {id}")))?;
            let root: PathBuf = volume
                .internal_path
                .clone()
                .ok_or_else(|| ServiceError::NotFound(format!("mount point of {id}")))?;
            root.join(file_id.to_string())
        };

        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => options.read(true),
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => return Err(ServiceError::InvalidArgument(format!("open flags {flags:#o}"))),
        };
        options.custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT));

        let file = options
            .open(&path)
            .map_err(|e| ServiceError::from(storage_contracts::StorageError::from(e)))?;
        Ok(OwnedFd::from(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::TestBed;
    use std::io::Read;
    use storage_types::MountState;

    #[tokio::test]
    async fn obb_images_mount_read_only_with_increasing_ids() {
        let bed = TestBed::started().await;
        let image = bed.config.paths.data_media.join("main.obb");
        std::fs::write(&image, b"obb").unwrap();

        let first = bed.manager.create_obb(&image, "", 50_123).await.unwrap();
        let second = bed.manager.create_obb(&image, "", 50_123).await.unwrap();
        assert_eq!(first, "obb:0");
        assert_eq!(second, "obb:1");

        let info = bed.manager.find_volume(&first).await.unwrap();
        assert_eq!(info.state, MountState::MountedReadOnly);
        let target = bed.config.paths.obb_root.join("0");
        assert!(bed.mounts.is_mounted_sync(&target));

        bed.manager.destroy_obb(&first).await.unwrap();
        assert!(bed.manager.find_volume(&first).await.is_none());
        assert!(!bed.mounts.is_mounted_sync(&target));
        assert_eq!(bed.mounts.loops_attached(), 1);
        assert!(matches!(
            bed.manager.destroy_obb(&first).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn keyed_or_relative_obbs_are_rejected() {
        let bed = TestBed::started().await;
        assert!(matches!(
            bed.manager.create_obb(Path::new("/data/app/main.obb"), "secret", 0).await,
            Err(ServiceError::Unsupported(_))
        ));
        assert!(matches!(
            bed.manager.create_obb(Path::new("main.obb"), "", 0).await,
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn failed_obb_mount_leaves_no_volume() {
        let bed = TestBed::started().await;
        bed.mounts.fail_mounts_of("/dev/loop0");
        let image = bed.config.paths.data_media.join("bad.obb");
        std::fs::write(&image, b"obb").unwrap();

        assert!(bed.manager.create_obb(&image, "", 0).await.is_err());
        assert!(bed.manager.list_volumes(Some(VolumeType::Obb)).await.is_empty());
        assert_eq!(bed.mounts.loops_attached(), 0);
    }

    #[tokio::test]
    async fn stub_volumes_carry_their_metadata() {
        let bed = TestBed::started().await;
        let id = bed
            .manager
            .create_stub_volume(
                Path::new("/mnt/pass_through/0/ABCD"),
                Path::new("/storage/ABCD"),
                "sdcardfs",
                "ABCD",
                "Stub",
            )
            .await
            .unwrap();
        assert_eq!(id, "stub:0");

        let info = bed.manager.find_volume(&id).await.unwrap();
        assert_eq!(info.fs_uuid, "ABCD");
        assert_eq!(info.state, MountState::Unmounted);

        bed.manager.mount(&id, MountFlags::empty(), None).await.unwrap();
        let info = bed.manager.find_volume(&id).await.unwrap();
        assert_eq!(info.path.as_deref(), Some("/storage/ABCD"));

        bed.manager.destroy_stub_volume(&id).await.unwrap();
        assert!(bed.manager.find_volume(&id).await.is_none());
        assert!(bed.manager.destroy_obb(&id).await.is_err());
    }

    #[tokio::test]
    async fn app_fuse_slots_are_exclusive_and_release_idempotently() {
        let bed = TestBed::started().await;
        let _device = bed.manager.mount_app_fuse(10_123, 1).await.unwrap();
        assert!(matches!(
            bed.manager.mount_app_fuse(10_123, 1).await,
            Err(ServiceError::AlreadyExists(_))
        ));

        let mount_point = bed.config.paths.appfuse_root.join("10123_1");
        std::fs::write(mount_point.join("7"), b"payload").unwrap();
        let fd = bed
            .manager
            .open_app_fuse_file(10_123, 1, 7, libc::O_RDONLY)
            .await
            .unwrap();
        let mut contents = String::new();
        std::fs::File::from(fd).read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "payload");

        bed.manager.unmount_app_fuse(10_123, 1).await.unwrap();
        bed.manager.unmount_app_fuse(10_123, 1).await.unwrap();
        assert!(matches!(
            bed.manager.open_app_fuse_file(10_123, 1, 7, libc::O_RDONLY).await,
            Err(ServiceError::NotFound(_))
        ));
        let _again = bed.manager.mount_app_fuse(10_123, 1).await.unwrap();
    }
}
