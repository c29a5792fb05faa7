// SPDX-License-Identifier: GPL-3.0-only

//! Listener implementations: D-Bus signals and plain logging

use storage_contracts::VolumeListener;
use storage_types::VolumeEvent;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const VOLUMES_OBJECT_PATH: &str = "/org/cosmic/ext/StorageService/volumes";

/// D-Bus object publishing volume lifecycle signals
pub struct VolumeSignals {
    version: String,
}

impl VolumeSignals {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[interface(name = "org.cosmic.ext.StorageService.Volumes")]
impl VolumeSignals {
    #[zbus(property)]
    async fn version(&self) -> &str {
        &self.version
    }

    /// Signal emitted when a disk is created
    ///
    /// Args: disk_id, flags (bitmask)
    #[zbus(signal)]
    async fn disk_created(
        signal_ctxt: &SignalEmitter<'_>,
        disk_id: &str,
        flags: u32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn disk_destroyed(signal_ctxt: &SignalEmitter<'_>, disk_id: &str) -> zbus::Result<()>;

    /// Signal emitted when a volume is created
    ///
    /// Args: volume_id, volume_type, disk_id ("" for standalone volumes)
    #[zbus(signal)]
    async fn volume_created(
        signal_ctxt: &SignalEmitter<'_>,
        volume_id: &str,
        volume_type: &str,
        disk_id: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn volume_state_changed(
        signal_ctxt: &SignalEmitter<'_>,
        volume_id: &str,
        old_state: &str,
        new_state: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn volume_destroyed(signal_ctxt: &SignalEmitter<'_>, volume_id: &str)
    -> zbus::Result<()>;

    /// Any other notification, serialized as JSON
    ///
    /// Args: kind, subject id, event JSON
    #[zbus(signal)]
    async fn volume_event(
        signal_ctxt: &SignalEmitter<'_>,
        kind: &str,
        subject: &str,
        event_json: &str,
    ) -> zbus::Result<()>;
}

fn event_kind(event: &VolumeEvent) -> &'static str {
    match event {
        VolumeEvent::DiskCreated { .. } => "disk_created",
        VolumeEvent::DiskMetadataChanged { .. } => "disk_metadata_changed",
        VolumeEvent::DiskScanned { .. } => "disk_scanned",
        VolumeEvent::DiskDestroyed { .. } => "disk_destroyed",
        VolumeEvent::VolumeCreated { .. } => "volume_created",
        VolumeEvent::VolumeStateChanged { .. } => "volume_state_changed",
        VolumeEvent::VolumeMetadataChanged { .. } => "volume_metadata_changed",
        VolumeEvent::VolumePathChanged { .. } => "volume_path_changed",
        VolumeEvent::VolumeInternalPathChanged { .. } => "volume_internal_path_changed",
        VolumeEvent::VolumeDestroyed { .. } => "volume_destroyed",
    }
}

async fn emit(emitter: &SignalEmitter<'_>, event: &VolumeEvent) -> zbus::Result<()> {
    match event {
        VolumeEvent::DiskCreated { disk_id, flags } => {
            VolumeSignals::disk_created(emitter, disk_id, flags.bits()).await
        }
        VolumeEvent::DiskDestroyed { disk_id } => {
            VolumeSignals::disk_destroyed(emitter, disk_id).await
        }
        VolumeEvent::VolumeCreated {
            volume_id,
            volume_type,
            disk_id,
            ..
        } => {
            VolumeSignals::volume_created(
                emitter,
                volume_id,
                volume_type.as_str(),
                disk_id.as_deref().unwrap_or_default(),
            )
            .await
        }
        VolumeEvent::VolumeStateChanged {
            volume_id,
            old,
            new,
        } => {
            VolumeSignals::volume_state_changed(emitter, volume_id, old.as_str(), new.as_str())
                .await
        }
        VolumeEvent::VolumeDestroyed { volume_id } => {
            VolumeSignals::volume_destroyed(emitter, volume_id).await
        }
        other => {
            let json = serde_json::to_string(other)
                .map_err(|e| zbus::Error::Failure(format!("Failed to serialize event: {e}")))?;
            VolumeSignals::volume_event(emitter, event_kind(other), other.subject(), &json).await
        }
    }
}

/// Queues events for a forwarder task that emits them as D-Bus signals
///
/// `notify` never waits on the bus.
pub struct DbusListener {
    sender: UnboundedSender<VolumeEvent>,
}

impl DbusListener {
    fn channel() -> (Self, UnboundedReceiver<VolumeEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Attach to the [`VolumeSignals`] object already served at `object_path`
    pub async fn start(connection: &zbus::Connection, object_path: &str) -> anyhow::Result<Self> {
        let iface_ref = connection
            .object_server()
            .interface::<_, VolumeSignals>(object_path)
            .await?;
        let (listener, mut receiver) = Self::channel();

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = emit(iface_ref.signal_emitter(), &event).await {
                    tracing::error!("Failed to emit {} signal: {}", event_kind(&event), e);
                }
            }
            tracing::debug!("Volume signal forwarder stopped");
        });

        Ok(listener)
    }
}

impl VolumeListener for DbusListener {
    fn notify(&self, event: VolumeEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("Volume signal forwarder is gone, dropping event");
        }
    }
}

/// Writes every event to the log; used when running without a bus
#[derive(Debug, Default)]
pub struct LogListener;

impl VolumeListener for LogListener {
    fn notify(&self, event: VolumeEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!("{} {}: {}", event_kind(&event), event.subject(), json),
            Err(_) => tracing::info!("{} {}", event_kind(&event), event.subject()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::MountState;

    #[test]
    fn events_are_queued_in_order() {
        let (listener, mut receiver) = DbusListener::channel();
        listener.notify(VolumeEvent::DiskScanned {
            disk_id: "disk:8,0".to_string(),
        });
        listener.notify(VolumeEvent::VolumeStateChanged {
            volume_id: "public:8,1".to_string(),
            old: MountState::Unmounted,
            new: MountState::Checking,
        });

        assert_eq!(receiver.try_recv().unwrap().subject(), "disk:8,0");
        let second = receiver.try_recv().unwrap();
        assert_eq!(event_kind(&second), "volume_state_changed");
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn notify_after_forwarder_exit_is_dropped() {
        let (listener, receiver) = DbusListener::channel();
        drop(receiver);
        listener.notify(VolumeEvent::DiskDestroyed {
            disk_id: "disk:8,0".to_string(),
        });
    }

    #[test]
    fn log_listener_accepts_every_event() {
        LogListener.notify(VolumeEvent::VolumePathChanged {
            volume_id: "public:8,1".to_string(),
            path: Some("/mnt/media_rw/ABCD-1234".to_string()),
        });
    }
}
