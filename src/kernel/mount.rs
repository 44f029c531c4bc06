//! Mount helpers for the fault device filesystem
use crate::kernel::control::{ControlError, ControlResult};
use log::warn;
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use std::fs;
use std::path::Path;

/// Decode the octal escapes `/proc/mounts` uses for whitespace and backslashes
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `path` is a mount point according to a `/proc/mounts` body
pub fn mounts_contain(mounts: &str, path: &Path) -> bool {
    let wanted = path.to_string_lossy();
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .map(|target| unescape_mount_field(target) == wanted)
            .unwrap_or(false)
    })
}

/// Check `/proc/mounts` for `path`
pub fn is_mounted(path: &Path) -> bool {
    match fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts_contain(&mounts, path),
        Err(e) => {
            warn!("Failed to read /proc/mounts: {}", e);
            false
        }
    }
}

fn errno_to_control(op: &str, path: &Path, err: Errno) -> ControlError {
    let message = format!("{} {}: {}", op, path.display(), err);
    match err {
        Errno::EPERM | Errno::EACCES => ControlError::PermissionDenied(message),
        Errno::EBUSY => ControlError::Busy(message),
        Errno::ENOENT | Errno::EINVAL | Errno::ENXIO => ControlError::NotFound(message),
        _ => ControlError::Failed(message),
    }
}

/// Mount `device` at `mount_point`, creating the directory if needed
pub fn mount_device(device: &Path, mount_point: &Path, filesystem: &str) -> ControlResult<()> {
    fs::create_dir_all(mount_point).map_err(|e| {
        ControlError::Failed(format!("create {}: {}", mount_point.display(), e))
    })?;

    nix::mount::mount(
        Some(device),
        mount_point,
        Some(filesystem),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| errno_to_control("mount", mount_point, e))
}

/// Unmount `mount_point`; a busy mount is detached lazily
pub fn unmount_path(mount_point: &Path) -> ControlResult<()> {
    if !is_mounted(mount_point) {
        return Err(ControlError::NotFound(mount_point.display().to_string()));
    }

    match nix::mount::umount2(mount_point, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(Errno::EBUSY) => {
            warn!(
                "{} is busy, falling back to lazy unmount",
                mount_point.display()
            );
            nix::mount::umount2(mount_point, MntFlags::MNT_DETACH)
                .map_err(|e| errno_to_control("umount", mount_point, e))
        }
        Err(e) => Err(errno_to_control("umount", mount_point, e)),
    }
}
