// SPDX-License-Identifier: GPL-3.0-only

//! Mount-table inspection and mount syscalls

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::{major, minor};
use tracing::{debug, info, warn};
use which::which;

use crate::error::{Result, SysError};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Parse every mount point out of a mountinfo table
pub fn parse_mount_points(input: &str) -> Result<Vec<PathBuf>> {
    let mut points = BTreeSet::new();
    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let (mount_point, _) = mount_point_and_options(line)?;
        points.insert(mount_point);
    }
    Ok(points.into_iter().collect())
}

/// Whether `target` is mounted read-only in a mountinfo table, `None` when absent
///
/// The last entry wins, since later mounts stack over earlier ones.
pub fn parse_mount_access(input: &str, target: &Path) -> Result<Option<bool>> {
    let mut access = None;
    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let (mount_point, options) = mount_point_and_options(line)?;
        if mount_point == target {
            access = Some(options.split(',').any(|option| option == "ro"));
        }
    }
    Ok(access)
}

/// Read-only state of `target` inside the mount namespace of `pid`
pub fn mount_access_in(pid: i32, target: &Path) -> Result<Option<bool>> {
    let path = format!("/proc/{pid}/mountinfo");
    let input = fs::read_to_string(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SysError::DeviceNotFound(format!("process {pid} exited")),
        _ => SysError::OperationFailed(format!("Failed to read {path}: {e}")),
    })?;
    parse_mount_access(&input, target)
}

fn mount_point_and_options(line: &str) -> Result<(PathBuf, &str)> {
    let invalid = || SysError::OperationFailed(format!("invalid mountinfo line: {line}"));
    let (left, _) = line.split_once(" - ").ok_or_else(invalid)?;
    let mut fields = left.split_whitespace().skip(4);
    let mount_point = fields.next().ok_or_else(invalid)?;
    let options = fields.next().ok_or_else(invalid)?;
    Ok((unescape_mount_field(mount_point), options))
}

/// Undo the kernel's octal escapes at the byte level
fn unescape_mount_field(value: &str) -> PathBuf {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 3 < bytes.len() {
            let digits = &bytes[index + 1..index + 4];
            if digits.iter().all(|digit| (b'0'..=b'7').contains(digit)) {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, digit| acc * 8 + u16::from(digit - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    output.push(byte);
                    index += 4;
                    continue;
                }
            }
        }
        output.push(bytes[index]);
        index += 1;
    }

    PathBuf::from(OsStr::from_bytes(&output))
}

/// Mount points strictly below `root`, deepest first
pub fn select_under(points: &[PathBuf], root: &Path) -> Vec<PathBuf> {
    let mut under: Vec<PathBuf> = points
        .iter()
        .filter(|point| point.starts_with(root) && point.as_path() != root)
        .cloned()
        .collect();
    under.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    under
}

pub fn read_mount_points() -> Result<Vec<PathBuf>> {
    parse_mount_points(&fs::read_to_string(MOUNTINFO)?)
}

pub fn is_mounted(target: &Path) -> Result<bool> {
    Ok(read_mount_points()?.iter().any(|point| point == target))
}

pub fn mounts_under(root: &Path) -> Result<Vec<PathBuf>> {
    Ok(select_under(&read_mount_points()?, root))
}

pub fn mount_filesystem(
    device: &Path,
    target: &Path,
    fs_type: &str,
    read_only: bool,
    options: &str,
) -> Result<()> {
    let mut flags = MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_DIRSYNC;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    let data = (!options.is_empty()).then_some(options);

    info!(
        "Mounting {} ({}) at {}",
        device.display(),
        fs_type,
        target.display()
    );
    mount(Some(device), target, Some(fs_type), flags, data)
        .map_err(|e| SysError::from_nix(e, format!("mount {}", target.display())))
}

pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    debug!("Binding {} to {}", source.display(), target.display());
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| SysError::from_nix(e, format!("bind {}", target.display())))?;

    if read_only {
        let remount = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
        if let Err(e) = mount(None::<&str>, target, None::<&str>, remount, None::<&str>) {
            let _ = umount2(target, MntFlags::MNT_DETACH);
            return Err(SysError::from_nix(e, format!("remount ro {}", target.display())));
        }
    }
    Ok(())
}

pub fn unmount(target: &Path, detach: bool) -> Result<()> {
    let flags = if detach {
        MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };
    debug!("Unmounting {}", target.display());
    umount2(target, flags)
        .map_err(|e| SysError::from_nix(e, format!("unmount {}", target.display())))
}

fn fsck_command(fs_type: &str) -> Option<(&'static str, &'static [&'static str])> {
    match fs_type {
        "vfat" => Some(("fsck.vfat", &["-p", "-f"])),
        "exfat" => Some(("fsck.exfat", &["-p"])),
        "ext4" => Some(("e2fsck", &["-f", "-p"])),
        "f2fs" => Some(("fsck.f2fs", &["-a"])),
        _ => None,
    }
}

/// Run the filesystem checker for `fs_type` against `device`
pub fn check_filesystem(device: &Path, fs_type: &str) -> Result<()> {
    let (tool, args) = fsck_command(fs_type)
        .ok_or_else(|| SysError::Unsupported(format!("filesystem type {fs_type}")))?;
    let tool_path = which(tool)
        .map_err(|_| SysError::Unsupported(format!("{tool} not installed")))?;

    let output = Command::new(tool_path)
        .args(args)
        .arg(device)
        .output()
        .map_err(|e| SysError::OperationFailed(format!("Failed to run {tool}: {e}")))?;

    // fsck exit codes: 0 clean, 1 errors corrected, anything else is fatal.
    match output.status.code() {
        Some(0) | Some(1) => Ok(()),
        code => {
            warn!(
                "{} on {} exited with {:?}: {}",
                tool,
                device.display(),
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Err(SysError::OperationFailed(format!(
                "{tool} reported an unrecoverable filesystem on {}",
                device.display()
            )))
        }
    }
}

/// Attach `image` to a free loop device
pub fn attach_loop(image: &Path) -> Result<(PathBuf, u32, u32)> {
    let losetup = which("losetup")
        .map_err(|_| SysError::Unsupported("losetup not installed".to_string()))?;
    let output = Command::new(losetup)
        .args(["--find", "--show"])
        .arg(image)
        .output()
        .map_err(|e| SysError::OperationFailed(format!("Failed to run losetup: {e}")))?;

    if !output.status.success() {
        return Err(SysError::OperationFailed(format!(
            "losetup failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let device = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    let rdev = fs::metadata(&device)?.rdev();
    Ok((device, major(rdev) as u32, minor(rdev) as u32))
}

pub fn detach_loop(device: &Path) -> Result<()> {
    let losetup = which("losetup")
        .map_err(|_| SysError::Unsupported("losetup not installed".to_string()))?;
    let output = Command::new(losetup)
        .arg("-d")
        .arg(device)
        .output()
        .map_err(|e| SysError::OperationFailed(format!("Failed to run losetup: {e}")))?;

    if !output.status.success() {
        return Err(SysError::OperationFailed(format!(
            "losetup -d {} failed: {}",
            device.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Open `/dev/fuse` and mount a session for `uid` at `target`
pub fn mount_fuse(target: &Path, uid: u32) -> Result<OwnedFd> {
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open("/dev/fuse")
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SysError::DeviceNotFound("/dev/fuse".to_string()),
            _ => SysError::Io(e),
        })?;
    let fd = OwnedFd::from(device);

    let options = format!(
        "fd={},rootmode=40000,default_permissions,allow_other,user_id={uid},group_id={uid}",
        std::os::fd::AsRawFd::as_raw_fd(&fd)
    );
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOATIME;
    mount(Some("AppFuse"), target, Some("fuse"), flags, Some(options.as_str()))
        .map_err(|e| SysError::from_nix(e, format!("fuse mount {}", target.display())))?;

    Ok(fd)
}
