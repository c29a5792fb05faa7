// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorKind {
    InvalidInput,
    NotFound,
    PermissionDenied,
    Conflict,
    Unsupported,
    Busy,
    Timeout,
    Unavailable,
    Internal,
}

impl StorageErrorKind {
    pub fn code(self) -> u16 {
        match self {
            Self::InvalidInput => 400,
            Self::NotFound => 404,
            Self::PermissionDenied => 403,
            Self::Conflict => 409,
            Self::Unsupported => 501,
            Self::Busy => 423,
            Self::Timeout => 504,
            Self::Unavailable => 503,
            Self::Internal => 500,
        }
    }

    /// Negative POSIX error code used by the status convention
    pub fn errno(self) -> i32 {
        -match self {
            Self::InvalidInput => libc::EINVAL,
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::Conflict => libc::EEXIST,
            Self::Unsupported => libc::EOPNOTSUPP,
            Self::Busy => libc::EBUSY,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Unavailable => libc::EAGAIN,
            Self::Internal => libc::EIO,
        }
    }

    /// Classify an OS error number
    pub fn from_errno(errno: i32) -> Self {
        match errno.abs() {
            libc::EINVAL | libc::ENAMETOOLONG | libc::ENOTDIR | libc::ELOOP => Self::InvalidInput,
            libc::ENOENT | libc::ENXIO | libc::ENODEV => Self::NotFound,
            libc::EACCES | libc::EPERM | libc::EROFS => Self::PermissionDenied,
            libc::EEXIST => Self::Conflict,
            libc::EOPNOTSUPP | libc::ENOSYS => Self::Unsupported,
            libc::EBUSY => Self::Busy,
            libc::ETIMEDOUT => Self::Timeout,
            libc::EAGAIN => Self::Unavailable,
            _ => Self::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.kind == StorageErrorKind::Busy
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        let kind = err
            .raw_os_error()
            .map(StorageErrorKind::from_errno)
            .unwrap_or(StorageErrorKind::Internal);
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_roundtrips() {
        let error = StorageError::new(StorageErrorKind::Conflict, "already exists");
        let json = serde_json::to_string(&error).expect("serialize error");
        let parsed: StorageError = serde_json::from_str(&json).expect("deserialize error");
        assert_eq!(parsed, error);
    }

    #[test]
    fn storage_error_kind_http_family_codes_are_stable() {
        assert_eq!(StorageErrorKind::InvalidInput.code(), 400);
        assert_eq!(StorageErrorKind::NotFound.code(), 404);
        assert_eq!(StorageErrorKind::PermissionDenied.code(), 403);
        assert_eq!(StorageErrorKind::Conflict.code(), 409);
        assert_eq!(StorageErrorKind::Unsupported.code(), 501);
        assert_eq!(StorageErrorKind::Internal.code(), 500);
    }

    #[test]
    fn errno_is_negative_posix() {
        assert_eq!(StorageErrorKind::Busy.errno(), -libc::EBUSY);
        assert_eq!(StorageErrorKind::NotFound.errno(), -libc::ENOENT);
        assert_eq!(StorageErrorKind::from_errno(-libc::EBUSY), StorageErrorKind::Busy);
        assert_eq!(StorageErrorKind::from_errno(libc::EPERM), StorageErrorKind::PermissionDenied);
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err: StorageError = std::io::Error::from_raw_os_error(libc::EBUSY).into();
        assert!(err.is_busy());
    }
}
