// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for the volume daemon
//!
//! This crate provides direct system interfaces for operations the orchestrator
//! must perform itself, such as:
//! - Path-safety validation and directory preparation
//! - Mount-table inspection and mount/unmount syscalls
//! - Loop devices, filesystem checks and FUSE device setup
//! - Sysfs and udev-database probing of block devices
//! - Process discovery and in-namespace remounting
//! - Key files and the fscrypt key tool
//!
//! These operations require elevated privileges and should only be called
//! from the privileged service (storage-service).

pub mod error;
pub mod keys;
pub mod mounts;
pub mod ownership;
pub mod paths;
pub mod process;
pub mod sysfs;

pub use error::{Result, SysError};
pub use paths::{
    DirStatus, ensure_dir, mkdirs, prepare_dir, remove_tree, replace_symlink, validate_path,
};
pub use sysfs::SysfsProbe;
