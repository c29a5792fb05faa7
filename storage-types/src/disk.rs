//! Disk data models
//!
//! These types describe a block device as the orchestrator sees it. The live
//! `Disk` stays inside the service; `DiskInfo` is the by-value snapshot handed to
//! callers and listeners.

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

/// Classification flags attached to a disk by its matching disk source
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFlag {
    /// Media may be adopted as private (encrypted) internal storage
    Adoptable = 1 << 0,

    /// Media should become the primary volume when no other primary exists
    DefaultPrimary = 1 << 1,

    /// SD card slot
    Sd = 1 << 2,

    /// USB mass storage
    Usb = 1 << 3,

    /// Embedded MMC
    Emmc = 1 << 4,
}

pub type DiskFlags = BitFlags<DiskFlag>;

/// Stable identity of a disk derived from its device numbers
pub fn disk_id_for(major: u32, minor: u32) -> String {
    format!("disk:{major},{minor}")
}

/// Snapshot of one disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskInfo {
    /// Stable identifier (e.g. "disk:8,0")
    pub id: String,

    /// Kernel device numbers
    pub major: u32,
    pub minor: u32,

    /// Device-tree path the disk was classified by
    pub sys_path: String,

    /// Device nodes observed for this disk
    pub device_paths: Vec<String>,

    /// Nickname from the matching disk source
    pub nickname: String,

    /// Flags from the matching disk source
    pub flags: DiskFlags,

    /// Total size in bytes (0 until metadata has been read)
    pub size: u64,

    /// Vendor or model label
    pub label: String,

    /// Whether probing was deferred (keyguard showing or user 0 not started)
    pub pending: bool,

    /// Ids of the volumes found on this disk, in partition order
    pub volumes: Vec<String>,
}

impl DiskInfo {
    pub fn is_adoptable(&self) -> bool {
        self.flags.contains(DiskFlag::Adoptable)
    }

    /// Get a human-readable display name for the disk
    pub fn display_name(&self) -> String {
        if !self.label.is_empty() {
            format!("{} {}", self.nickname, self.label)
        } else {
            self.nickname.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_id_uses_major_minor() {
        assert_eq!(disk_id_for(8, 0), "disk:8,0");
        assert_eq!(disk_id_for(179, 64), "disk:179,64");
    }

    #[test]
    fn flags_roundtrip_through_bits() {
        let flags: DiskFlags = DiskFlag::Sd | DiskFlag::Adoptable;
        let json = serde_json::to_string(&flags).unwrap();
        let parsed: DiskFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, flags);
        assert_eq!(flags.bits(), 0b101);
    }

    #[test]
    fn display_name_prefers_label() {
        let mut disk = DiskInfo {
            id: "disk:8,0".to_string(),
            major: 8,
            minor: 0,
            sys_path: "/devices/pci0000:00/usb1/block/sda".to_string(),
            device_paths: vec!["/dev/sda".to_string()],
            nickname: "usb".to_string(),
            flags: DiskFlag::Usb.into(),
            size: 0,
            label: "SanDisk".to_string(),
            pending: false,
            volumes: Vec::new(),
        };
        assert_eq!(disk.display_name(), "usb SanDisk");
        disk.label.clear();
        assert_eq!(disk.display_name(), "usb");
    }
}
