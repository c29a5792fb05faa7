//! Device events consumed by the orchestrator and notifications it emits

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{DiskFlags, MountState, VolumeType};

/// Block-device event action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    Add,
    Change,
    Remove,
}

impl DeviceAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "add" => Some(Self::Add),
            "change" => Some(Self::Change),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// One block-device notification: action, device-tree path and uevent attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub action: DeviceAction,

    /// Device-tree path (e.g. "/devices/pci0000:00/.../block/sda")
    pub sys_path: String,

    /// Device node, when known (e.g. "/dev/sda")
    pub device_path: Option<String>,

    /// Raw uevent attributes (MAJOR, MINOR, DEVTYPE, DEVNAME, NPARTS, ...)
    pub attributes: BTreeMap<String, String>,
}

impl DeviceEvent {
    pub fn new(action: DeviceAction, sys_path: impl Into<String>) -> Self {
        Self {
            action,
            sys_path: sys_path.into(),
            device_path: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_device_path(mut self, path: impl Into<String>) -> Self {
        self.device_path = Some(path.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn major(&self) -> Option<u32> {
        self.attribute("MAJOR")?.trim().parse().ok()
    }

    pub fn minor(&self) -> Option<u32> {
        self.attribute("MINOR")?.trim().parse().ok()
    }

    pub fn devtype(&self) -> Option<&str> {
        self.attribute("DEVTYPE")
    }

    /// Build a "disk" event from a sysfs uevent file body (`KEY=value` lines)
    pub fn from_uevent(action: DeviceAction, sys_path: impl Into<String>, body: &str) -> Self {
        let mut event = Self::new(action, sys_path);
        for line in body.lines() {
            if let Some((key, value)) = line.split_once('=') {
                event.attributes.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        if let Some(name) = event.attribute("DEVNAME") {
            event.device_path = Some(format!("/dev/{name}"));
        }
        event
    }
}

/// Listener notification
///
/// Events carry ids and values only; the live model is never shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum VolumeEvent {
    DiskCreated {
        disk_id: String,
        flags: DiskFlags,
    },
    DiskMetadataChanged {
        disk_id: String,
        size: u64,
        label: String,
        sys_path: String,
    },
    DiskScanned {
        disk_id: String,
    },
    DiskDestroyed {
        disk_id: String,
    },
    VolumeCreated {
        volume_id: String,
        volume_type: VolumeType,
        disk_id: Option<String>,
        part_guid: Option<String>,
    },
    VolumeStateChanged {
        volume_id: String,
        old: MountState,
        new: MountState,
    },
    VolumeMetadataChanged {
        volume_id: String,
        fs_type: String,
        fs_uuid: String,
        fs_label: String,
    },
    VolumePathChanged {
        volume_id: String,
        path: Option<String>,
    },
    VolumeInternalPathChanged {
        volume_id: String,
        path: Option<String>,
    },
    VolumeDestroyed {
        volume_id: String,
    },
}

impl VolumeEvent {
    /// Id of the disk or volume the event is about
    pub fn subject(&self) -> &str {
        match self {
            Self::DiskCreated { disk_id, .. }
            | Self::DiskMetadataChanged { disk_id, .. }
            | Self::DiskScanned { disk_id }
            | Self::DiskDestroyed { disk_id } => disk_id,
            Self::VolumeCreated { volume_id, .. }
            | Self::VolumeStateChanged { volume_id, .. }
            | Self::VolumeMetadataChanged { volume_id, .. }
            | Self::VolumePathChanged { volume_id, .. }
            | Self::VolumeInternalPathChanged { volume_id, .. }
            | Self::VolumeDestroyed { volume_id } => volume_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uevent_body() {
        let body = "MAJOR=8\nMINOR=16\nDEVNAME=sdb\nDEVTYPE=disk\nDISKSEQ=9\n";
        let event = DeviceEvent::from_uevent(DeviceAction::Add, "/devices/usb1/block/sdb", body);
        assert_eq!(event.major(), Some(8));
        assert_eq!(event.minor(), Some(16));
        assert_eq!(event.devtype(), Some("disk"));
        assert_eq!(event.device_path.as_deref(), Some("/dev/sdb"));
    }

    #[test]
    fn missing_numbers_are_none() {
        let event =
            DeviceEvent::new(DeviceAction::Change, "/devices/x").with_attribute("MAJOR", "x");
        assert_eq!(event.major(), None);
        assert_eq!(event.minor(), None);
    }

    #[test]
    fn subject_names_the_entity() {
        let event = VolumeEvent::VolumeStateChanged {
            volume_id: "public:8,1".to_string(),
            old: MountState::Checking,
            new: MountState::Mounted,
        };
        assert_eq!(event.subject(), "public:8,1");
        assert_eq!(DeviceAction::parse("remove"), Some(DeviceAction::Remove));
        assert_eq!(DeviceAction::parse("move"), None);
    }
}
