// SPDX-License-Identifier: GPL-3.0-only

//! Volume daemon
//!
//! Watches block devices, runs the volume lifecycle and maintains per-user
//! storage sandboxes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures_util::FutureExt;
use storage_contracts::VolumeListener;
use storage_sys::SysfsProbe;
use tracing_subscriber::{EnvFilter, fmt};
use zbus::connection::Builder as ConnectionBuilder;

mod adapters;
mod config;
mod error;
mod event_loop;
mod listener;
mod manager;
mod monitor;
mod routing;

use config::{DEFAULT_CONFIG_PATH, ServiceConfig};
use event_loop::{EVENT_QUEUE_DEPTH, spawn_event_loop};
use listener::{DbusListener, LogListener, VOLUMES_OBJECT_PATH, VolumeSignals};
use manager::VolumeManager;
use monitor::BlockMonitor;
use routing::{AdapterRegistry, Concern};

const BUS_NAME: &str = "org.cosmic.ext.Storage.Volumes";

/// Volume daemon: disk/volume lifecycle and per-user storage sandboxes
#[derive(Parser)]
#[command(name = "storage-volumed")]
#[command(about = "Volume daemon for removable, adopted and emulated storage", long_about = None)]
struct Cli {
    /// Configuration file (defaults apply when it does not exist)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log every raw block event
    #[arg(long)]
    debug: bool,

    /// Log volume events instead of publishing them on the system bus
    #[arg(long)]
    no_dbus: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storage_service=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting storage volume daemon v{}", env!("CARGO_PKG_VERSION"));

    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("Volume daemon must run as root");
        anyhow::bail!("Service must run with root privileges");
    }

    let config = ServiceConfig::load(&cli.config)?;
    tracing::info!("Loaded configuration from {}", cli.config.display());

    // Fail fast if a required concern has no adapter.
    let registry = AdapterRegistry::build_default()?;
    tracing::info!(
        "Adapter routing: Mounts -> {}, Keys -> {}, Probe -> {}, Processes -> {}, Ownership -> {}",
        registry.route_for(Concern::Mounts).unwrap_or("<missing>"),
        registry.route_for(Concern::Keys).unwrap_or("<missing>"),
        registry.route_for(Concern::Probe).unwrap_or("<missing>"),
        registry.route_for(Concern::Processes).unwrap_or("<missing>"),
        registry.route_for(Concern::Ownership).unwrap_or("<missing>")
    );

    let (listener, _connection): (Arc<dyn VolumeListener>, Option<zbus::Connection>) =
        if cli.no_dbus {
            tracing::info!("D-Bus disabled, volume events go to the log");
            (Arc::new(LogListener), None)
        } else {
            let connection = ConnectionBuilder::system()?
                .name(BUS_NAME)?
                .serve_at(VOLUMES_OBJECT_PATH, VolumeSignals::new())?
                .build()
                .await?;
            tracing::info!("Service registered on D-Bus system bus");
            tracing::info!("  - {} at {}", BUS_NAME, VOLUMES_OBJECT_PATH);
            let listener = DbusListener::start(&connection, VOLUMES_OBJECT_PATH).await?;
            (Arc::new(listener), Some(connection))
        };

    let poll_interval_ms = config.monitor.poll_interval_ms;
    let manager = Arc::new(VolumeManager::new(config, registry.adapters(), listener)?);
    manager.set_debug(cli.debug).await;
    manager.start().await?;

    let (handle, event_loop) = spawn_event_loop(manager, EVENT_QUEUE_DEPTH);
    let mut block_monitor = BlockMonitor::new(SysfsProbe::default());
    if let Err(e) = block_monitor.cold_plug(&handle).await {
        tracing::warn!("Cold plug failed: {}", e);
    }
    let hotplug = block_monitor.spawn(handle.clone(), poll_interval_ms);

    tracing::info!("Volume daemon ready, waiting for events...");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    if let Some(hotplug) = hotplug {
        hotplug.abort();
        let _ = hotplug.await;
    }

    let outcome = handle
        .call(|manager| {
            async move {
                let shutdown = manager.shutdown().await;
                manager.stop().await.and(shutdown)
            }
            .boxed()
        })
        .await?;
    if let Err(e) = outcome {
        tracing::error!("Shutdown finished with errors: {}", e);
    }

    // The loop exits once the last handle is gone.
    drop(handle);
    let _ = event_loop.await;

    tracing::info!("Storage volume daemon shutting down");
    Ok(())
}
