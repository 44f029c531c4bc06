//! Virtual device control surface.
//!
//! [`DeviceControl`] is the seam between the fault-injection logic and the
//! host: loop binding, device-mapper tables, mkfs and mount. The system
//! implementation shells out to `losetup`, `dmsetup` and `mkfs.*` and uses
//! `nix` for mount and statvfs.

use crate::kernel::{loopdev, mount};
use log::{debug, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Failure reported by a control operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("{0}")]
    Failed(String),
}

pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Host operations needed to build and tear down a fault device.
///
/// Removal operations report [`ControlError::NotFound`] for absent targets so
/// callers can treat them as already done.
pub trait DeviceControl: Send + Sync {
    /// Bytes available to unprivileged writers in `dir`
    fn available_bytes(&self, dir: &Path) -> ControlResult<u64>;

    /// System hint for the next unbound loop slot
    fn next_free_loop(&self) -> ControlResult<Option<u32>>;

    /// Whether `slot` currently has a backing file
    fn loop_slot_bound(&self, slot: u32) -> bool;

    fn attach_loop(&self, slot: u32, backing: &Path) -> ControlResult<()>;

    fn detach_loop(&self, device: &Path) -> ControlResult<()>;

    fn create_mapping(&self, name: &str, table: &str) -> ControlResult<()>;

    fn remove_mapping(&self, name: &str) -> ControlResult<()>;

    fn mapping_exists(&self, name: &str) -> bool;

    fn format(&self, device: &Path, filesystem: &str) -> ControlResult<()>;

    fn mount(&self, device: &Path, mount_point: &Path, filesystem: &str) -> ControlResult<()>;

    fn unmount(&self, mount_point: &Path) -> ControlResult<()>;

    fn is_mounted(&self, mount_point: &Path) -> bool;

    /// Whether `escalate` would succeed. Must not change any state.
    fn can_escalate(&self) -> bool {
        false
    }

    /// Switch to elevated execution for subsequent operations.
    /// Returns false when no elevation path exists.
    fn escalate(&self) -> bool {
        false
    }
}

/// Path of a device-mapper device by name
pub fn mapped_device_path(name: &str) -> PathBuf {
    PathBuf::from("/dev/mapper").join(name)
}

/// [`DeviceControl`] backed by the host's tools and syscalls
#[derive(Debug, Default)]
pub struct SystemDeviceControl {
    elevated: AtomicBool,
}

impl SystemDeviceControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_elevated(&self) -> bool {
        self.elevated.load(Ordering::SeqCst)
    }

    /// Non-interactive sudo is configured for this user
    fn sudo_available() -> bool {
        Command::new("sudo")
            .args(["-n", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run a tool, optionally through `sudo -n`, returning stdout
    fn run_tool(&self, program: &str, args: &[&str], stdin: Option<&str>) -> ControlResult<String> {
        let mut cmd = if self.is_elevated() {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("exec: {} {}", program, args.join(" "));
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ControlError::Failed(format!("{} is not installed", program))
            }
            std::io::ErrorKind::PermissionDenied => {
                ControlError::PermissionDenied(format!("{}: {}", program, e))
            }
            _ => ControlError::Failed(format!("spawn {}: {}", program, e)),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .map_err(|e| ControlError::Failed(format!("write {} stdin: {}", program, e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ControlError::Failed(format!("wait {}: {}", program, e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_tool_error(program, &stderr))
    }
}

/// Map a tool's stderr onto a [`ControlError`] kind
fn classify_tool_error(program: &str, stderr: &str) -> ControlError {
    let message = format!("{}: {}", program, stderr);
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("a password is required")
        || lower.contains("must be superuser")
    {
        ControlError::PermissionDenied(message)
    } else if lower.contains("busy") {
        ControlError::Busy(message)
    } else if lower.contains("no such device")
        || lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("no such file")
    {
        ControlError::NotFound(message)
    } else {
        ControlError::Failed(message)
    }
}

impl DeviceControl for SystemDeviceControl {
    fn available_bytes(&self, dir: &Path) -> ControlResult<u64> {
        let stat = nix::sys::statvfs::statvfs(dir).map_err(|e| match e {
            nix::errno::Errno::ENOENT => ControlError::NotFound(dir.display().to_string()),
            nix::errno::Errno::EACCES => ControlError::PermissionDenied(dir.display().to_string()),
            other => ControlError::Failed(format!("statvfs {}: {}", dir.display(), other)),
        })?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn next_free_loop(&self) -> ControlResult<Option<u32>> {
        let out = self.run_tool("losetup", &["-f"], None)?;
        Ok(loopdev::parse_loop_slot(out.trim()))
    }

    fn loop_slot_bound(&self, slot: u32) -> bool {
        loopdev::slot_bound_in_sysfs(slot)
    }

    fn attach_loop(&self, slot: u32, backing: &Path) -> ControlResult<()> {
        let device = loopdev::loop_device_path(slot).display().to_string();
        let backing = backing.display().to_string();
        self.run_tool("losetup", &[device.as_str(), backing.as_str()], None)
            .map(|_| ())
    }

    fn detach_loop(&self, device: &Path) -> ControlResult<()> {
        if let Some(slot) = device.to_str().and_then(loopdev::parse_loop_slot) {
            if !loopdev::slot_bound_in_sysfs(slot) {
                return Err(ControlError::NotFound(device.display().to_string()));
            }
        }
        let device = device.display().to_string();
        self.run_tool("losetup", &["-d", device.as_str()], None)
            .map(|_| ())
    }

    fn create_mapping(&self, name: &str, table: &str) -> ControlResult<()> {
        self.run_tool("dmsetup", &["create", name], Some(table))
            .map(|_| ())
    }

    fn remove_mapping(&self, name: &str) -> ControlResult<()> {
        if !self.mapping_exists(name) {
            return Err(ControlError::NotFound(name.to_string()));
        }
        self.run_tool("dmsetup", &["remove", name], None).map(|_| ())
    }

    fn mapping_exists(&self, name: &str) -> bool {
        mapped_device_path(name).exists()
    }

    fn format(&self, device: &Path, filesystem: &str) -> ControlResult<()> {
        let program = format!("mkfs.{}", filesystem);
        let device = device.display().to_string();
        let mut args: Vec<&str> = match filesystem {
            "ext2" | "ext3" | "ext4" => vec!["-F", "-q"],
            "xfs" | "btrfs" => vec!["-f", "-q"],
            _ => Vec::new(),
        };
        args.push(device.as_str());
        self.run_tool(&program, &args, None).map(|_| ())
    }

    fn mount(&self, device: &Path, mount_point: &Path, filesystem: &str) -> ControlResult<()> {
        if self.is_elevated() {
            let device = device.display().to_string();
            let target = mount_point.display().to_string();
            return self
                .run_tool("mount", &["-t", filesystem, device.as_str(), target.as_str()], None)
                .map(|_| ());
        }
        mount::mount_device(device, mount_point, filesystem)
    }

    fn unmount(&self, mount_point: &Path) -> ControlResult<()> {
        if self.is_elevated() {
            if !mount::is_mounted(mount_point) {
                return Err(ControlError::NotFound(mount_point.display().to_string()));
            }
            let target = mount_point.display().to_string();
            return self.run_tool("umount", &[target.as_str()], None).map(|_| ());
        }
        mount::unmount_path(mount_point)
    }

    fn is_mounted(&self, mount_point: &Path) -> bool {
        mount::is_mounted(mount_point)
    }

    fn can_escalate(&self) -> bool {
        !self.is_elevated() && Self::sudo_available()
    }

    // applies to root too; a namespaced root can still be refused a loop device
    fn escalate(&self) -> bool {
        if self.is_elevated() {
            return false;
        }
        let sudo_ok = Self::sudo_available();
        if sudo_ok {
            warn!("Escalating device control to sudo -n");
            self.elevated.store(true, Ordering::SeqCst);
        }
        sudo_ok
    }
}
