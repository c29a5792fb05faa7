//! Volume data models

use std::fmt;

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

/// Kind of mountable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType {
    /// Portable media mounted as-is (vfat/exfat)
    Public,
    /// Adopted media, encrypted with a per-partition key
    Private,
    /// Directory-backed internal storage
    Emulated,
    /// Externally managed filesystem surfaced without a backing disk
    Stub,
    /// Loop-mounted application archive
    Obb,
    /// Per-application user-space filesystem session
    AppFuse,
}

impl VolumeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Emulated => "emulated",
            Self::Stub => "stub",
            Self::Obb => "obb",
            Self::AppFuse => "appfuse",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mount lifecycle of a volume
///
/// `Unmounted → Checking → Mounted → Unmounting → Unmounted`, with `Unmountable`
/// on a failed check/mount and `Removed`/`BadRemoval` once the volume is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    Checking,
    Mounted,
    MountedReadOnly,
    Unmounting,
    Unmountable,
    Removed,
    BadRemoval,
}

impl MountState {
    pub fn is_mounted(self) -> bool {
        matches!(self, Self::Mounted | Self::MountedReadOnly)
    }

    /// States from which a mount may be attempted
    pub fn can_mount(self) -> bool {
        matches!(self, Self::Unmounted | Self::Unmountable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unmounted => "unmounted",
            Self::Checking => "checking",
            Self::Mounted => "mounted",
            Self::MountedReadOnly => "mounted_read_only",
            Self::Unmounting => "unmounting",
            Self::Unmountable => "unmountable",
            Self::Removed => "removed",
            Self::BadRemoval => "bad_removal",
        }
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags supplied by the caller of `mount`
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountFlag {
    Primary = 1 << 0,
    Visible = 1 << 1,
}

pub type MountFlags = BitFlags<MountFlag>;

/// Snapshot of one volume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    pub id: String,
    pub volume_type: VolumeType,

    /// Owning disk, `None` for emulated/stub/OBB/app-fuse volumes
    pub disk_id: Option<String>,

    /// Partition GUID for private volumes
    pub part_guid: Option<String>,

    pub state: MountState,
    pub mount_flags: MountFlags,
    pub mount_user_id: Option<u32>,

    pub fs_type: String,
    pub fs_uuid: String,
    pub fs_label: String,

    /// Raw mount point (e.g. "/mnt/media_rw/1234-ABCD")
    pub internal_path: Option<String>,

    /// User-facing mount point (e.g. "/storage/1234-ABCD")
    pub path: Option<String>,
}

impl VolumeInfo {
    pub fn is_visible(&self) -> bool {
        self.mount_flags.contains(MountFlag::Visible)
    }
}
