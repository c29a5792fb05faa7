// SPDX-License-Identifier: GPL-3.0-only

//! Single consumer feeding the orchestrator
//!
//! Block-device events and host calls share one queue. One task runs them in
//! arrival order, so a `change` or `remove` never overtakes an in-flight mount
//! and a call never interleaves with device handling.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use storage_types::DeviceEvent;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, ServiceError};
use crate::manager::VolumeManager;

pub const EVENT_QUEUE_DEPTH: usize = 256;

type Job = Box<dyn FnOnce(Arc<VolumeManager>) -> BoxFuture<'static, ()> + Send>;

enum Request {
    Device(DeviceEvent),
    Call(Job),
}

fn stopped() -> ServiceError {
    ServiceError::Unavailable("volume manager loop has stopped".to_string())
}

/// Cloneable producer side of the loop
#[derive(Clone)]
pub struct VolumeManagerHandle {
    sender: mpsc::Sender<Request>,
}

impl VolumeManagerHandle {
    pub async fn device_event(&self, event: DeviceEvent) -> Result<()> {
        self.sender
            .send(Request::Device(event))
            .await
            .map_err(|_| stopped())
    }

    /// Run `op` on the loop and wait for its output
    pub async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<VolumeManager>) -> BoxFuture<'static, T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, output) = oneshot::channel();
        let job: Job = Box::new(move |manager| {
            Box::pin(async move {
                let _ = reply.send(op(manager).await);
            })
        });
        self.sender
            .send(Request::Call(job))
            .await
            .map_err(|_| stopped())?;
        output.await.map_err(|_| stopped())
    }
}

/// Start the consumer; it exits once every handle has been dropped
pub fn spawn_event_loop(
    manager: Arc<VolumeManager>,
    capacity: usize,
) -> (VolumeManagerHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel(capacity);

    let handle = tokio::spawn(async move {
        while let Some(request) = receiver.recv().await {
            match request {
                Request::Device(event) => manager.handle_block_event(event).await,
                Request::Call(job) => job(manager.clone()).await,
            }
        }
        tracing::info!("Volume manager loop stopped");
    });

    (VolumeManagerHandle { sender }, handle)
}
