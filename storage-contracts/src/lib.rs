// SPDX-License-Identifier: GPL-3.0-only

pub mod protocol;
pub mod traits;

pub use protocol::{StorageError, StorageErrorKind};
pub use traits::{
    DiskMetadata, DiskProbeAdapter, FsMetadata, KeyBuffer, KeyOpsAdapter, LoopDevice,
    MountAccess, MountOpsAdapter, MountRequest, OwnershipOpsAdapter, PartitionEntry, PartitionKind,
    ProcessOpsAdapter, RemountEntry, VolumeListener,
};
