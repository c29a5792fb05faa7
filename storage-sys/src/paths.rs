// SPDX-License-Identifier: GPL-3.0-only

//! Path-safety validation and directory preparation
//!
//! Every mutating path operation goes through [`validate_path`] first: the path
//! must be absolute, carry no `.` or `..` segments, live under one of the
//! supplied roots, and must not traverse a symlink below that root. Validation
//! happens before anything is touched, so a rejected path leaves no trace.

use std::fs::{self, DirBuilder};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SysError};

/// Outcome of [`ensure_dir`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirStatus {
    pub created: bool,
    pub mode_fixed: bool,
}

impl DirStatus {
    pub fn changed(&self) -> bool {
        self.created || self.mode_fixed
    }
}

/// Validate `path` against the managed `roots`, returning the owning root.
pub fn validate_path(path: &Path, roots: &[PathBuf]) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(SysError::unsafe_path(path, "path is not absolute"));
    }

    check_segments(path)?;

    let root = roots
        .iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
        .ok_or_else(|| SysError::unsafe_path(path, "not under a managed volume"))?;

    let mut current = root.clone();
    for component in path.strip_prefix(root).unwrap_or(Path::new("")).components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(SysError::unsafe_path(
                    path,
                    format!("symlink at {}", current.display()),
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(SysError::Io(e)),
        }
    }

    Ok(root.clone())
}

// `Path::components` silently drops interior "." segments, so inspect raw bytes.
fn check_segments(path: &Path) -> Result<()> {
    for segment in path.as_os_str().as_bytes().split(|b| *b == b'/') {
        if segment == b"." || segment == b".." {
            return Err(SysError::unsafe_path(path, "relative segment in path"));
        }
    }
    Ok(())
}

/// Ensure every directory along `path` exists.
///
/// The last segment is treated as a file name and ignored unless `path` ends in `/`.
pub fn mkdirs(path: &Path, roots: &[PathBuf]) -> Result<()> {
    validate_path(path, roots)?;

    let dir = if path.as_os_str().as_bytes().ends_with(b"/") {
        path
    } else {
        match path.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        }
    };

    DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    debug!("Ensured directories for {}", path.display());
    Ok(())
}

/// Create `path` with `mode` if missing, or correct its mode in place.
///
/// Does not validate; use [`prepare_dir`] for caller-supplied paths.
pub fn ensure_dir(path: &Path, mode: u32) -> Result<DirStatus> {
    let mut status = DirStatus::default();

    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if !metadata.is_dir() {
                return Err(SysError::OperationFailed(format!(
                    "{} exists and is not a directory",
                    path.display()
                )));
            }
            if metadata.permissions().mode() & 0o7777 != mode {
                fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
                status.mode_fixed = true;
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            DirBuilder::new().mode(mode).create(path)?;
            // The umask may have stripped bits.
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
            status.created = true;
        }
        Err(e) => return Err(SysError::Io(e)),
    }

    Ok(status)
}

/// Validate `path`, then [`ensure_dir`] it.
pub fn prepare_dir(path: &Path, mode: u32, roots: &[PathBuf]) -> Result<DirStatus> {
    validate_path(path, roots)?;
    ensure_dir(path, mode)
}

/// Point the symlink at `link` to `target`, replacing an existing symlink.
///
/// Returns `false` when the link already pointed at `target`.
pub fn replace_symlink(link: &Path, target: &Path, roots: &[PathBuf]) -> Result<bool> {
    check_segments(link)?;
    let parent = link
        .parent()
        .filter(|_| link.file_name().is_some())
        .ok_or_else(|| SysError::unsafe_path(link, "link has no file name"))?;
    validate_path(parent, roots)?;

    match fs::symlink_metadata(link) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            if fs::read_link(link)? == target {
                return Ok(false);
            }
            fs::remove_file(link)?;
        }
        Ok(_) => {
            return Err(SysError::OperationFailed(format!(
                "{} exists and is not a symlink",
                link.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SysError::Io(e)),
    }

    symlink(target, link)?;
    Ok(true)
}

/// Validate `path`, then remove it and everything below it. Missing paths are fine.
pub fn remove_tree(path: &Path, roots: &[PathBuf]) -> Result<()> {
    let root = validate_path(path, roots)?;
    if root.as_path() == path {
        return Err(SysError::unsafe_path(path, "refusing to remove a managed root"));
    }

    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SysError::Io(e)),
    }
    Ok(())
}
