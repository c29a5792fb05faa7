// SPDX-License-Identifier: GPL-3.0-only

//! Cold plug and hotplug polling of `/sys/block`

use std::collections::BTreeMap;
use std::time::Duration;

use storage_sys::SysfsProbe;
use storage_types::{DeviceAction, DeviceEvent};
use tokio::task::JoinHandle;

use crate::error::{Result, ServiceError};
use crate::event_loop::VolumeManagerHandle;

/// Events turning the `previous` device set into `current`
///
/// Removals come first so a node reused under the same path is re-added fresh.
pub fn diff_block_devices(
    previous: &BTreeMap<String, DeviceEvent>,
    current: &[DeviceEvent],
) -> Vec<DeviceEvent> {
    let mut events: Vec<DeviceEvent> = previous
        .iter()
        .filter(|(sys_path, _)| !current.iter().any(|event| &event.sys_path == *sys_path))
        .map(|(_, gone)| DeviceEvent {
            action: DeviceAction::Remove,
            ..gone.clone()
        })
        .collect();

    events.extend(
        current
            .iter()
            .filter(|event| !previous.contains_key(&event.sys_path))
            .cloned(),
    );
    events
}

pub struct BlockMonitor {
    probe: SysfsProbe,
    known: BTreeMap<String, DeviceEvent>,
}

impl BlockMonitor {
    pub fn new(probe: SysfsProbe) -> Self {
        Self {
            probe,
            known: BTreeMap::new(),
        }
    }

    async fn scan(&self) -> Result<Vec<DeviceEvent>> {
        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || probe.scan_block_devices())
            .await
            .map_err(|e| ServiceError::OperationFailed(format!("sysfs scan task failed: {e}")))?
            .map_err(ServiceError::from)
    }

    /// Changes since the previous scan; the first call reports every device
    pub async fn poll(&mut self) -> Result<Vec<DeviceEvent>> {
        let current = self.scan().await?;
        let events = diff_block_devices(&self.known, &current);
        self.known = current
            .into_iter()
            .map(|event| (event.sys_path.clone(), event))
            .collect();
        Ok(events)
    }

    /// Synthesize an `add` for every device already present
    pub async fn cold_plug(&mut self, handle: &VolumeManagerHandle) -> Result<usize> {
        let events = self.poll().await?;
        let count = events.len();
        for event in events {
            handle.device_event(event).await?;
        }
        tracing::info!("Cold plug found {} block device(s)", count);
        Ok(count)
    }

    /// Keep polling every `interval_ms`; `0` disables hotplug polling
    pub fn spawn(
        mut self,
        handle: VolumeManagerHandle,
        interval_ms: u64,
    ) -> Option<JoinHandle<()>> {
        if interval_ms == 0 {
            tracing::info!("Hotplug polling disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let events = match self.poll().await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("Block device scan failed: {}", e);
                        continue;
                    }
                };
                for event in events {
                    tracing::debug!("Hotplug {:?} {}", event.action, event.sys_path);
                    if handle.device_event(event).await.is_err() {
                        tracing::info!("Event loop closed, stopping hotplug monitor");
                        return;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn disk(sys_path: &str, minor: u32) -> DeviceEvent {
        DeviceEvent::new(DeviceAction::Add, sys_path)
            .with_attribute("MAJOR", "8")
            .with_attribute("MINOR", minor.to_string())
            .with_attribute("DEVTYPE", "disk")
    }

    fn add_block(sys: &Path, name: &str, minor: u32) {
        let dir = sys.join("block").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("uevent"),
            format!("MAJOR=8\nMINOR={minor}\nDEVNAME={name}\nDEVTYPE=disk\n"),
        )
        .unwrap();
    }

    #[test]
    fn diff_reports_removals_then_additions() {
        let previous: BTreeMap<_, _> = [disk("/block/sda", 0), disk("/block/sdb", 16)]
            .into_iter()
            .map(|event| (event.sys_path.clone(), event))
            .collect();
        let current = vec![disk("/block/sda", 0), disk("/block/sdc", 32)];

        let events = diff_block_devices(&previous, &current);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, DeviceAction::Remove);
        assert_eq!(events[0].sys_path, "/block/sdb");
        assert_eq!(events[0].minor(), Some(16));
        assert_eq!(events[1].action, DeviceAction::Add);
        assert_eq!(events[1].sys_path, "/block/sdc");
    }

    #[test]
    fn unchanged_set_yields_nothing() {
        let previous: BTreeMap<_, _> = [(String::from("/block/sda"), disk("/block/sda", 0))]
            .into_iter()
            .collect();
        assert!(diff_block_devices(&previous, &[disk("/block/sda", 0)]).is_empty());
    }

    #[tokio::test]
    async fn polling_tracks_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path().join("sys");
        add_block(&sys, "sdb", 16);
        let mut monitor = BlockMonitor::new(SysfsProbe::new(&sys, dir.path().join("udev")));

        let first = monitor.poll().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].sys_path, "/block/sdb");
        assert_eq!(first[0].device_path.as_deref(), Some("/dev/sdb"));
        assert!(monitor.poll().await.unwrap().is_empty());

        fs::remove_dir_all(sys.join("block/sdb")).unwrap();
        add_block(&sys, "sdc", 32);
        let events = monitor.poll().await.unwrap();
        let summary: Vec<_> = events
            .iter()
            .map(|event| (event.action, event.sys_path.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (DeviceAction::Remove, "/block/sdb"),
                (DeviceAction::Add, "/block/sdc"),
            ]
        );
    }

    #[tokio::test]
    async fn zero_interval_disables_polling() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = BlockMonitor::new(SysfsProbe::new(dir.path(), dir.path()));
        let bed = crate::manager::testing::TestBed::new();
        let (handle, _task) =
            crate::event_loop::spawn_event_loop(std::sync::Arc::new(bed.manager), 1);
        assert!(monitor.spawn(handle, 0).is_none());
    }
}
