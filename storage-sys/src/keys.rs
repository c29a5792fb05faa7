// SPDX-License-Identifier: GPL-3.0-only

//! Stored key files and the fscrypt key tool

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};
use which::which;

use crate::error::{Result, SysError};

/// Lower-case hex with separators stripped, as used in key file names
pub fn normalize_hex(guid: &str) -> Result<String> {
    let hex: String = guid
        .chars()
        .filter(|c| *c != '-' && *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SysError::OperationFailed(format!("Invalid GUID: {guid}")));
    }
    Ok(hex)
}

/// Key file for the private partition `part_guid`
pub fn key_path(key_dir: &Path, part_guid: &str) -> Result<PathBuf> {
    Ok(key_dir.join(format!("expand_{}.key", normalize_hex(part_guid)?)))
}

pub fn read_key(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Err(SysError::OperationFailed(format!(
            "Key file {} is empty",
            path.display()
        ))),
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(SysError::DeviceNotFound(format!("key {}", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete a stored key, overwriting its contents first
pub fn forget_key(path: &Path) -> Result<()> {
    let len = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Err(SysError::unsafe_path(path, "key is not a regular file")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SysError::DeviceNotFound(format!("key {}", path.display())));
        }
        Err(e) => return Err(e.into()),
    };

    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(&vec![0u8; len as usize])?;
    file.sync_all()?;
    drop(file);
    fs::remove_file(path)?;
    info!("Forgot key {}", path.display());
    Ok(())
}

fn fscryptctl() -> Result<PathBuf> {
    which("fscryptctl").map_err(|_| SysError::Unsupported("fscryptctl not installed".to_string()))
}

fn require_v2(policy_version: u32) -> Result<()> {
    if policy_version != 2 {
        return Err(SysError::Unsupported(format!(
            "fscrypt policy version {policy_version}"
        )));
    }
    Ok(())
}

/// Add `key` to the filesystem keyring of `mountpoint`, returning its identifier
pub fn install_key(key: &[u8], mountpoint: &Path, policy_version: u32) -> Result<String> {
    require_v2(policy_version)?;

    let mut child = Command::new(fscryptctl()?)
        .arg("add_key")
        .arg(mountpoint)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SysError::OperationFailed(format!("Failed to run fscryptctl: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(key)?;
    }
    let output = child
        .wait_with_output()
        .map_err(|e| SysError::OperationFailed(format!("fscryptctl add_key: {e}")))?;

    if !output.status.success() {
        return Err(SysError::OperationFailed(format!(
            "fscryptctl add_key failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let raw_ref = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if raw_ref.is_empty() {
        return Err(SysError::OperationFailed(
            "fscryptctl add_key returned no identifier".to_string(),
        ));
    }
    debug!("Installed key {} on {}", raw_ref, mountpoint.display());
    Ok(raw_ref)
}

pub fn evict_key(mountpoint: &Path, raw_ref: &str, policy_version: u32) -> Result<()> {
    require_v2(policy_version)?;

    let output = Command::new(fscryptctl()?)
        .arg("remove_key")
        .arg(raw_ref)
        .arg(mountpoint)
        .output()
        .map_err(|e| SysError::OperationFailed(format!("Failed to run fscryptctl: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("busy") {
            return Err(SysError::Busy(format!("key {raw_ref} still in use")));
        }
        return Err(SysError::OperationFailed(format!(
            "fscryptctl remove_key failed: {stderr}"
        )));
    }
    debug!("Evicted key {} from {}", raw_ref, mountpoint.display());
    Ok(())
}

/// Create (or reuse) a sparse file of `size_bytes` at `path`
pub fn create_sparse_image(path: &Path, size_bytes: u64) -> Result<bool> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if !meta.is_file() {
            return Err(SysError::unsafe_path(path, "image is not a regular file"));
        }
        return Ok(false);
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.set_len(size_bytes)?;
    info!("Created sparse image {} ({} bytes)", path.display(), size_bytes);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_use_normalized_guid() {
        let path = key_path(Path::new("/data/misc/vold"), "193D1EA4-B3CA-11E4-B075-10604B889DCF")
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/data/misc/vold/expand_193d1ea4b3ca11e4b07510604b889dcf.key")
        );
        assert!(normalize_hex("not-a-guid").is_err());
        assert!(normalize_hex("").is_err());
    }

    #[test]
    fn read_and_forget_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = key_path(dir.path(), "abcd").unwrap();
        assert!(matches!(read_key(&path), Err(SysError::DeviceNotFound(_))));

        fs::write(&path, [7u8; 16]).unwrap();
        assert_eq!(read_key(&path).unwrap(), vec![7u8; 16]);

        forget_key(&path).unwrap();
        assert!(!path.exists());
        assert!(matches!(forget_key(&path), Err(SysError::DeviceNotFound(_))));
    }

    #[test]
    fn forget_refuses_symlinked_key() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        fs::write(&victim, b"keep").unwrap();
        let link = dir.path().join("expand_ab.key");
        std::os::unix::fs::symlink(&victim, &link).unwrap();

        assert!(matches!(forget_key(&link), Err(SysError::UnsafePath { .. })));
        assert_eq!(fs::read(&victim).unwrap(), b"keep");
    }

    #[test]
    fn only_v2_policies_are_supported() {
        assert!(matches!(
            install_key(b"k", Path::new("/"), 1),
            Err(SysError::Unsupported(_))
        ));
    }

    #[test]
    fn sparse_image_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("virtual_disk");
        assert!(create_sparse_image(&image, 1 << 20).unwrap());
        assert_eq!(fs::metadata(&image).unwrap().len(), 1 << 20);
        assert!(!create_sparse_image(&image, 1 << 20).unwrap());
    }
}
