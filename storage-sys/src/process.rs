// SPDX-License-Identifier: GPL-3.0-only

//! Process discovery and per-namespace remounting

use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};
use which::which;

use crate::error::{Result, SysError};

/// Every pid currently running as `uid`
///
/// Processes that vanish or cannot be inspected mid-scan are skipped.
pub fn pids_for_uid(uid: u32) -> Result<Vec<i32>> {
    let all = procfs::process::all_processes()
        .map_err(|e| SysError::OperationFailed(format!("Failed to enumerate processes: {e}")))?;

    let mut pids = Vec::new();
    for process in all.flatten() {
        match process.uid() {
            Ok(owner) if owner == uid => pids.push(process.pid()),
            Ok(_) => {}
            Err(_) => continue,
        }
    }
    pids.sort_unstable();
    debug!("Found {} process(es) for uid {}", pids.len(), uid);
    Ok(pids)
}

/// Mount namespace action run inside a target process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceOp<'a> {
    Bind {
        source: &'a Path,
        target: &'a Path,
        read_only: bool,
    },
    Unmount {
        target: &'a Path,
    },
}

fn nsenter_args(pid: i32, op: NamespaceOp<'_>) -> Vec<String> {
    let mut args = vec![
        "--target".to_string(),
        pid.to_string(),
        "--mount".to_string(),
        "--".to_string(),
    ];
    match op {
        NamespaceOp::Bind {
            source,
            target,
            read_only,
        } => {
            args.push("mount".to_string());
            args.push("--rbind".to_string());
            if read_only {
                args.push("-o".to_string());
                args.push("ro".to_string());
            }
            args.push(source.display().to_string());
            args.push(target.display().to_string());
        }
        NamespaceOp::Unmount { target } => {
            args.push("umount".to_string());
            args.push("-l".to_string());
            args.push(target.display().to_string());
        }
    }
    args
}

/// Apply `op` inside the mount namespace of `pid`
pub fn remount_in_namespace(pid: i32, op: NamespaceOp<'_>) -> Result<()> {
    if pid <= 1 {
        return Err(SysError::PermissionDenied(format!(
            "Refusing to enter namespace of pid {pid}"
        )));
    }
    let nsenter = which("nsenter")
        .map_err(|_| SysError::Unsupported("nsenter not installed".to_string()))?;

    let output = Command::new(nsenter)
        .args(nsenter_args(pid, op))
        .output()
        .map_err(|e| SysError::OperationFailed(format!("Failed to run nsenter: {e}")))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !Path::new(&format!("/proc/{pid}")).exists() {
        return Err(SysError::DeviceNotFound(format!("process {pid} exited")));
    }
    warn!("Namespace remount in pid {} failed: {}", pid, stderr);
    Err(SysError::OperationFailed(format!(
        "remount in pid {pid} failed: {stderr}"
    )))
}
