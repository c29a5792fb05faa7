// SPDX-License-Identifier: GPL-3.0-only

//! Daemon configuration loaded from TOML

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use storage_types::{DiskFlag, DiskFlags};

use crate::error::{Result, ServiceError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/storage-service/volumes.toml";

/// Well-known directories the orchestrator mounts into and materializes below
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Per-user external storage views (e.g. /storage/emulated/0)
    pub storage_root: PathBuf,
    /// Raw mount points of public volumes
    pub media_rw_root: PathBuf,
    /// Mount points of private (adopted) volumes
    pub expand_root: PathBuf,
    /// Per-user package sandboxes and primary entry points
    pub user_root: PathBuf,
    /// Runtime views used by the legacy remount
    pub runtime_root: PathBuf,
    pub obb_root: PathBuf,
    pub appfuse_root: PathBuf,
    /// Backing directory of the internal emulated volume
    pub data_media: PathBuf,
    /// Stored keys and the virtual disk image
    pub key_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/storage"),
            media_rw_root: PathBuf::from("/mnt/media_rw"),
            expand_root: PathBuf::from("/mnt/expand"),
            user_root: PathBuf::from("/mnt/user"),
            runtime_root: PathBuf::from("/mnt/runtime"),
            obb_root: PathBuf::from("/mnt/obb"),
            appfuse_root: PathBuf::from("/mnt/appfuse"),
            data_media: PathBuf::from("/data/media"),
            key_dir: PathBuf::from("/data/misc/vold"),
        }
    }
}

impl PathsConfig {
    /// Roots every mutating path operation must stay below
    pub fn managed_roots(&self) -> Vec<PathBuf> {
        vec![
            self.media_rw_root.clone(),
            self.expand_root.clone(),
            self.user_root.clone(),
            self.obb_root.clone(),
            self.appfuse_root.clone(),
            self.data_media.clone(),
        ]
    }
}

/// One classification rule as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSourceConfig {
    pub pattern: String,
    pub nickname: String,
    #[serde(default)]
    pub flags: Vec<DiskFlag>,
}

impl DiskSourceConfig {
    pub fn flag_set(&self) -> DiskFlags {
        self.flags.iter().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualDiskConfig {
    pub enabled: bool,
    pub size_mb: u64,
}

impl Default for VirtualDiskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size_mb: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sysfs polling period; 0 disables hotplug polling
    pub poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
        }
    }
}

fn default_disk_sources() -> Vec<DiskSourceConfig> {
    vec![
        DiskSourceConfig {
            pattern: "*/mmc_host/*".to_string(),
            nickname: "sdcard".to_string(),
            flags: vec![DiskFlag::Sd, DiskFlag::Adoptable],
        },
        DiskSourceConfig {
            pattern: "*/usb*".to_string(),
            nickname: "usb".to_string(),
            flags: vec![DiskFlag::Usb],
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub paths: PathsConfig,
    pub disk_sources: Vec<DiskSourceConfig>,
    pub virtual_disk: VirtualDiskConfig,
    pub monitor: MonitorConfig,
    pub media_rw_uid: u32,
    pub media_rw_gid: u32,
    pub key_policy_version: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            disk_sources: default_disk_sources(),
            virtual_disk: VirtualDiskConfig::default(),
            monitor: MonitorConfig::default(),
            media_rw_uid: 1023,
            media_rw_gid: 1023,
            key_policy_version: 2,
        }
    }
}

impl ServiceConfig {
    /// Load `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ServiceError::InvalidArgument(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Self::parse(&raw)
            .map_err(|e| ServiceError::InvalidArgument(format!("{}: {e}", path.display())))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("storage_root", &self.paths.storage_root),
            ("media_rw_root", &self.paths.media_rw_root),
            ("expand_root", &self.paths.expand_root),
            ("user_root", &self.paths.user_root),
            ("runtime_root", &self.paths.runtime_root),
            ("obb_root", &self.paths.obb_root),
            ("appfuse_root", &self.paths.appfuse_root),
            ("data_media", &self.paths.data_media),
            ("key_dir", &self.paths.key_dir),
        ] {
            if !path.is_absolute() {
                return Err(ServiceError::InvalidArgument(format!(
                    "paths.{name} must be absolute"
                )));
            }
        }
        if let Some(source) = self.disk_sources.iter().find(|s| s.nickname.is_empty()) {
            return Err(ServiceError::InvalidArgument(format!(
                "disk source {} has no nickname",
                source.pattern
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ServiceConfig::parse("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.disk_sources.len(), 2);
        assert_eq!(config.key_policy_version, 2);
    }

    #[test]
    fn sections_override_defaults() {
        let config = ServiceConfig::parse(
            r#"
            media_rw_gid = 2000

            [paths]
            user_root = "/run/user-storage"

            [[disk_sources]]
            pattern = "*/block/sda"
            nickname = "sdcard"
            flags = ["sd", "adoptable"]

            [virtual_disk]
            enabled = true

            [monitor]
            poll_interval_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.media_rw_gid, 2000);
        assert_eq!(config.paths.user_root, PathBuf::from("/run/user-storage"));
        assert_eq!(config.paths.storage_root, PathBuf::from("/storage"));
        assert_eq!(config.disk_sources.len(), 1);
        assert_eq!(
            config.disk_sources[0].flag_set(),
            DiskFlag::Sd | DiskFlag::Adoptable
        );
        assert!(config.virtual_disk.enabled);
        assert_eq!(config.virtual_disk.size_mb, 512);
        assert_eq!(config.monitor.poll_interval_ms, 0);
    }

    #[test]
    fn relative_paths_are_rejected() {
        let err = ServiceConfig::parse("[paths]\nkey_dir = \"misc/vold\"\n").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ServiceConfig::default());
    }
}
