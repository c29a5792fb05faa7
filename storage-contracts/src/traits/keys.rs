// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::StorageError;

/// Raw key material, wiped on drop
#[derive(PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyBuffer(Vec<u8>);

impl KeyBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBuffer({} bytes)", self.0.len())
    }
}

/// Key-management collaborator used when mounting encrypted volumes
#[async_trait]
pub trait KeyOpsAdapter: Send + Sync {
    /// Install `key` for the filesystem at `mountpoint`, returning the raw key reference
    async fn install_key(
        &self,
        key: &KeyBuffer,
        mountpoint: &Path,
        policy_version: u32,
    ) -> Result<String, StorageError>;

    async fn evict_key(
        &self,
        mountpoint: &Path,
        raw_ref: &str,
        policy_version: u32,
    ) -> Result<(), StorageError>;
}
