// SPDX-License-Identifier: GPL-3.0-only

//! Key-operation lock around the key-management collaborator

use std::path::Path;
use std::sync::Arc;

use storage_contracts::{KeyBuffer, KeyOpsAdapter, StorageError};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, ServiceError};

/// Serializes key installation and eviction
///
/// The guard lives only for the duration of one collaborator call, so a slow
/// filesystem mount never holds it.
pub struct CryptGate {
    keys: Arc<dyn KeyOpsAdapter>,
    lock: Mutex<()>,
    policy_version: u32,
}

fn key_error(err: StorageError) -> ServiceError {
    if err.is_busy() {
        ServiceError::Busy(err.message)
    } else {
        ServiceError::Key(err.message)
    }
}

impl CryptGate {
    pub fn new(keys: Arc<dyn KeyOpsAdapter>, policy_version: u32) -> Self {
        Self {
            keys,
            lock: Mutex::new(()),
            policy_version,
        }
    }

    pub async fn install(&self, key: &KeyBuffer, mountpoint: &Path) -> Result<String> {
        let _guard = self.lock.lock().await;
        debug!("Installing key for {}", mountpoint.display());
        self.keys
            .install_key(key, mountpoint, self.policy_version)
            .await
            .map_err(key_error)
    }

    pub async fn evict(&self, mountpoint: &Path, raw_ref: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        debug!("Evicting key {} from {}", raw_ref, mountpoint.display());
        self.keys
            .evict_key(mountpoint, raw_ref, self.policy_version)
            .await
            .map_err(key_error)
    }

    /// Whether a key call is in flight
    #[cfg(test)]
    pub fn is_held(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::FakeKeys;

    #[tokio::test]
    async fn lock_is_released_after_each_call() {
        let keys = Arc::new(FakeKeys::default());
        let gate = CryptGate::new(keys.clone(), 2);

        let raw_ref = gate
            .install(&KeyBuffer::new(vec![1; 64]), Path::new("/mnt/expand/x"))
            .await
            .unwrap();
        assert!(!gate.is_held());

        gate.evict(Path::new("/mnt/expand/x"), &raw_ref).await.unwrap();
        assert!(!gate.is_held());
        assert_eq!(keys.installed(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn failures_release_the_lock_and_map_to_key_errors() {
        let keys = Arc::new(FakeKeys::default());
        keys.fail_installs(true);
        let gate = CryptGate::new(keys, 2);

        let err = gate
            .install(&KeyBuffer::new(vec![1; 64]), Path::new("/mnt/expand/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Key(_)));
        assert!(!gate.is_held());
    }
}
