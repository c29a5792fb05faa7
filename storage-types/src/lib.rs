// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the storage volume daemon
//!
//! This crate defines the single source of truth for the types exchanged between
//! the orchestrator, its adapters and the listener:
//!
//! - **storage-sys**: produces `DeviceEvent`s from sysfs and consumes paths/ids
//! - **storage-contracts**: adapter traits are expressed in these types
//! - **storage-service**: owns the live model and hands out snapshots
//!
//! ## Architecture
//!
//! The live graph (disks → volumes → mount points) never leaves the orchestrator.
//! Everything in this crate is plain data:
//!
//! - `DiskInfo` / `VolumeInfo` → by-value snapshots of the live graph
//! - `DeviceEvent` → one kernel block-device notification
//! - `VolumeEvent` → one listener notification

pub mod disk;
pub mod event;
pub mod user;
pub mod volume;

pub use disk::{DiskFlag, DiskFlags, DiskInfo, disk_id_for};
pub use event::{DeviceAction, DeviceEvent, VolumeEvent};
pub use user::{
    AppId, PER_USER_RANGE, RemountMode, UserId, app_id_of, is_valid_user_id, multiuser_uid,
    user_id_of,
};
pub use volume::{MountFlag, MountFlags, MountState, VolumeInfo, VolumeType};
