// SPDX-License-Identifier: GPL-3.0-only

pub mod keys;
pub mod listener;
pub mod mount;
pub mod ownership;
pub mod probe;
pub mod process;

pub use keys::{KeyBuffer, KeyOpsAdapter};
pub use listener::VolumeListener;
pub use mount::{LoopDevice, MountOpsAdapter, MountRequest};
pub use ownership::OwnershipOpsAdapter;
pub use probe::{DiskMetadata, DiskProbeAdapter, FsMetadata, PartitionEntry, PartitionKind};
pub use process::{MountAccess, ProcessOpsAdapter, RemountEntry};
