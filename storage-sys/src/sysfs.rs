// SPDX-License-Identifier: GPL-3.0-only

//! Block-device probing through sysfs and the udev database

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use storage_types::{DeviceAction, DeviceEvent};
use tracing::{debug, warn};

use crate::error::{Result, SysError};

/// Partition type GUID of adopted (private) storage
pub const EXPAND_PART_TYPE: &str = "193d1ea4-b3ca-11e4-b075-10604b889dcf";

const SECTOR_SIZE: u64 = 512;

/// One partition found below a disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysPartition {
    pub number: u32,
    pub major: u32,
    pub minor: u32,
    pub device: PathBuf,
    pub part_type: Option<String>,
    pub part_uuid: Option<String>,
}

impl SysPartition {
    pub fn is_private(&self) -> bool {
        self.part_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(EXPAND_PART_TYPE))
    }
}

/// Filesystem identity from the udev database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SysFsInfo {
    pub fs_type: String,
    pub fs_uuid: String,
    pub fs_label: String,
}

/// Parse a udev database record (`E:KEY=value` lines)
pub fn parse_udev_data(body: &str) -> BTreeMap<String, String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("E:"))
        .filter_map(|entry| entry.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn parse_dev_numbers(raw: &str) -> Option<(u32, u32)> {
    let (major, minor) = raw.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn mmc_vendor(manfid: &str) -> Option<&'static str> {
    let id = u32::from_str_radix(manfid.trim().trim_start_matches("0x"), 16).ok()?;
    match id {
        0x000003 => Some("SanDisk"),
        0x00001b => Some("Samsung"),
        0x000028 => Some("Lexar"),
        0x000074 => Some("Transcend"),
        _ => None,
    }
}

/// Sysfs and udev roots used for probing
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    pub sysfs_root: PathBuf,
    pub udev_root: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            udev_root: PathBuf::from("/run/udev/data"),
        }
    }
}

impl SysfsProbe {
    pub fn new(sysfs_root: impl Into<PathBuf>, udev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            udev_root: udev_root.into(),
        }
    }

    /// Synthesise an `add` event for every block device currently present
    pub fn scan_block_devices(&self) -> Result<Vec<DeviceEvent>> {
        let block = self.sysfs_root.join("block");
        let mut events = Vec::new();

        for entry in fs::read_dir(&block)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let body = match fs::read_to_string(entry.path().join("uevent")) {
                Ok(body) => body,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };
            let sys_path = match fs::read_link(entry.path()) {
                Ok(link) => {
                    let link = link.to_string_lossy().to_string();
                    format!("/{}", link.trim_start_matches("../"))
                }
                Err(_) => format!("/block/{name}"),
            };
            events.push(DeviceEvent::from_uevent(DeviceAction::Add, sys_path, &body));
        }

        events.sort_by(|a, b| a.sys_path.cmp(&b.sys_path));
        Ok(events)
    }

    fn device_dir(&self, sys_path: &str, major: u32, minor: u32) -> PathBuf {
        let by_number = self
            .sysfs_root
            .join("dev/block")
            .join(format!("{major}:{minor}"));
        if by_number.exists() {
            by_number
        } else {
            self.sysfs_root.join(sys_path.trim_start_matches('/'))
        }
    }

    fn udev_record(&self, major: u32, minor: u32) -> BTreeMap<String, String> {
        fs::read_to_string(self.udev_root.join(format!("b{major}:{minor}")))
            .map(|body| parse_udev_data(&body))
            .unwrap_or_default()
    }

    fn device_node(dir: &Path, major: u32, minor: u32) -> PathBuf {
        fs::read_to_string(dir.join("uevent"))
            .ok()
            .and_then(|body| {
                body.lines()
                    .find_map(|line| line.strip_prefix("DEVNAME="))
                    .map(|name| PathBuf::from(format!("/dev/{}", name.trim())))
            })
            .unwrap_or_else(|| PathBuf::from(format!("/dev/block/{major}:{minor}")))
    }

    /// Size in bytes and a vendor label
    pub fn read_metadata(&self, sys_path: &str, major: u32, minor: u32) -> Result<(u64, String)> {
        let dir = self.device_dir(sys_path, major, minor);
        let sectors = fs::read_to_string(dir.join("size"))
            .map_err(|_| SysError::DeviceNotFound(format!("size of {major}:{minor}")))?;
        let size = sectors
            .trim()
            .parse::<u64>()
            .map_err(|e| {
                SysError::OperationFailed(format!("Invalid size for {major}:{minor}: {e}"))
            })?
            * SECTOR_SIZE;

        let read_trimmed = |name: &str| {
            fs::read_to_string(dir.join("device").join(name))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let label = read_trimmed("vendor")
            .or_else(|| read_trimmed("manfid").and_then(|id| mmc_vendor(&id).map(str::to_string)))
            .or_else(|| read_trimmed("model"))
            .unwrap_or_default();

        Ok((size, label))
    }

    /// Partitions below the disk, in partition-number order
    pub fn read_partitions(
        &self,
        sys_path: &str,
        major: u32,
        minor: u32,
    ) -> Result<Vec<SysPartition>> {
        let dir = self.device_dir(sys_path, major, minor);
        if !dir.is_dir() {
            return Err(SysError::DeviceNotFound(format!("block device {major}:{minor}")));
        }

        let mut partitions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Ok(number) = fs::read_to_string(path.join("partition")) else {
                continue;
            };
            let Some((part_major, part_minor)) = fs::read_to_string(path.join("dev"))
                .ok()
                .and_then(|raw| parse_dev_numbers(&raw))
            else {
                warn!("Partition {} has no device numbers", path.display());
                continue;
            };

            let udev = self.udev_record(part_major, part_minor);
            partitions.push(SysPartition {
                number: number.trim().parse().unwrap_or(0),
                major: part_major,
                minor: part_minor,
                device: Self::device_node(&path, part_major, part_minor),
                part_type: udev.get("ID_PART_ENTRY_TYPE").cloned(),
                part_uuid: udev.get("ID_PART_ENTRY_UUID").cloned(),
            });
        }

        partitions.sort_by_key(|p| p.number);
        Ok(partitions)
    }

    /// Device node of the whole disk
    pub fn disk_node(&self, sys_path: &str, major: u32, minor: u32) -> PathBuf {
        Self::device_node(&self.device_dir(sys_path, major, minor), major, minor)
    }

    pub fn read_fs_metadata(&self, major: u32, minor: u32) -> Result<SysFsInfo> {
        let udev = self.udev_record(major, minor);
        let fs_type = udev
            .get("ID_FS_TYPE")
            .cloned()
            .ok_or_else(|| SysError::OperationFailed(format!("No filesystem on {major}:{minor}")))?;

        Ok(SysFsInfo {
            fs_type,
            fs_uuid: udev.get("ID_FS_UUID").cloned().unwrap_or_default(),
            fs_label: udev.get("ID_FS_LABEL").cloned().unwrap_or_default(),
        })
    }
}
