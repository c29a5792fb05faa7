// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::{StorageError, StorageErrorKind};
use storage_sys::SysError;
use thiserror::Error;

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Unsafe path {path}: {reason}")]
    UnsafePath { path: String, reason: String },

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Key operation failed: {0}")]
    Key(String),

    #[error("{operation} failed for {}: {}", .failed.len(), .failed.join(", "))]
    PartialFailure {
        operation: String,
        failed: Vec<String>,
    },

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    /// Negative POSIX code reported to callers
    pub fn errno(&self) -> i32 {
        -match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::Precondition(_) => libc::EPERM,
            Self::UnsafePath { .. } => libc::EACCES,
            Self::Busy(_) => libc::EBUSY,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::OperationFailed(_) | Self::Key(_) | Self::PartialFailure { .. } => libc::EIO,
            Self::Unavailable(_) => libc::EAGAIN,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}

/// `0` on success, otherwise the negative errno of the failure
pub fn status<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.errno(),
    }
}

impl From<SysError> for ServiceError {
    fn from(err: SysError) -> Self {
        match err {
            SysError::UnsafePath { path, reason } => Self::UnsafePath { path, reason },
            SysError::Busy(msg) => Self::Busy(msg),
            SysError::DeviceNotFound(msg) => Self::NotFound(msg),
            SysError::Unsupported(msg) => Self::Unsupported(msg),
            SysError::PermissionDenied(msg) => {
                Self::OperationFailed(format!("permission denied: {msg}"))
            }
            SysError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::NotFound(e.to_string())
            }
            other => Self::OperationFailed(other.to_string()),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err.kind {
            StorageErrorKind::InvalidInput => Self::InvalidArgument(err.message),
            StorageErrorKind::NotFound => Self::NotFound(err.message),
            StorageErrorKind::Conflict => Self::AlreadyExists(err.message),
            StorageErrorKind::Unsupported => Self::Unsupported(err.message),
            StorageErrorKind::Busy => Self::Busy(err.message),
            StorageErrorKind::Unavailable | StorageErrorKind::Timeout => {
                Self::Unavailable(err.message)
            }
            StorageErrorKind::PermissionDenied | StorageErrorKind::Internal => {
                Self::OperationFailed(err.message)
            }
        }
    }
}

/// Adapter-side conversion from the low-level error
pub fn storage_error(err: SysError) -> StorageError {
    let kind = match &err {
        SysError::Io(e) => e
            .raw_os_error()
            .map(StorageErrorKind::from_errno)
            .unwrap_or(StorageErrorKind::Internal),
        SysError::PermissionDenied(_) => StorageErrorKind::PermissionDenied,
        SysError::DeviceNotFound(_) => StorageErrorKind::NotFound,
        SysError::UnsafePath { .. } => StorageErrorKind::InvalidInput,
        SysError::Busy(_) => StorageErrorKind::Busy,
        SysError::Unsupported(_) => StorageErrorKind::Unsupported,
        SysError::OperationFailed(_) => StorageErrorKind::Internal,
    };
    StorageError::new(kind, err.to_string())
}

pub type Result<T> = std::result::Result<T, ServiceError>;
