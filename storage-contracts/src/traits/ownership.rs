// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use std::path::Path;

use crate::StorageError;

/// File ownership queries and changes (chown requires privileges)
#[async_trait]
pub trait OwnershipOpsAdapter: Send + Sync {
    async fn owner(&self, path: &Path) -> Result<(u32, u32), StorageError>;

    async fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<(), StorageError>;
}
