// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Unsafe path {path}: {reason}")]
    UnsafePath { path: String, reason: String },

    #[error("Device or resource busy: {0}")]
    Busy(String),

    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl SysError {
    pub(crate) fn unsafe_path(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::UnsafePath {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn from_nix(err: nix::Error, context: impl std::fmt::Display) -> Self {
        match err {
            nix::Error::EBUSY => Self::Busy(context.to_string()),
            nix::Error::EPERM | nix::Error::EACCES => {
                Self::PermissionDenied(format!("{context}: {err}"))
            }
            nix::Error::ENOENT | nix::Error::ENODEV | nix::Error::ENXIO => {
                Self::DeviceNotFound(format!("{context}: {err}"))
            }
            _ => Self::OperationFailed(format!("{context}: {err}")),
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
