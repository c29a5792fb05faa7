// SPDX-License-Identifier: GPL-3.0-only

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::{Result, SysError};

/// Owner and group of `path`, without following a trailing symlink
pub fn owner(path: &Path) -> Result<(u32, u32)> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok((meta.uid(), meta.gid()))
}

/// Change ownership of `path` itself; symlinks are never followed
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        SysError::OperationFailed(format!("Invalid path for chown {}: {}", path.display(), e))
    })?;
    let result = unsafe { libc::lchown(c_path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => {
                SysError::PermissionDenied(format!("chown {}: {}", path.display(), err))
            }
            _ => SysError::OperationFailed(format!("Failed to chown {}: {}", path.display(), err)),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chown_to_current_owner_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = owner(dir.path()).unwrap();
        set_owner(dir.path(), uid, gid).unwrap();
        assert_eq!(owner(dir.path()).unwrap(), (uid, gid));
    }

    #[test]
    fn missing_path_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(owner(&dir.path().join("nope")), Err(SysError::Io(_))));
    }
}
