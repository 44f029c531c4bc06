/// In-memory device control for tests.
///
/// Models the ordering constraints the kernel enforces: a mapped device
/// cannot be removed while its device is mounted, and a loop device cannot be
/// detached while a mapping table references it. Every mutating call is
/// logged so tests can assert on the order of operations.
use crate::kernel::control::{mapped_device_path, ControlError, ControlResult, DeviceControl};
use crate::kernel::loopdev;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct FakeState {
    available_bytes: u64,
    loops: BTreeMap<u32, PathBuf>,
    mappings: BTreeMap<String, String>,
    formatted: BTreeSet<PathBuf>,
    /// mount point -> device
    mounts: BTreeMap<PathBuf, PathBuf>,
    operations: Vec<String>,
    fail_format: bool,
    fail_mount: bool,
    fail_create_mapping: bool,
    fail_remove_mapping: bool,
    /// Some(allowed): loop attach is refused until escalated
    escalation: Option<bool>,
    escalated: bool,
}

#[derive(Debug)]
pub struct FakeDeviceControl {
    state: Mutex<FakeState>,
}

impl Default for FakeDeviceControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDeviceControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                available_bytes: u64::MAX,
                ..FakeState::default()
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn set_available_bytes(&self, bytes: u64) {
        self.with(|s| s.available_bytes = bytes);
    }

    pub fn fail_format(&self, fail: bool) {
        self.with(|s| s.fail_format = fail);
    }

    pub fn fail_mount(&self, fail: bool) {
        self.with(|s| s.fail_mount = fail);
    }

    pub fn fail_create_mapping(&self, fail: bool) {
        self.with(|s| s.fail_create_mapping = fail);
    }

    pub fn fail_remove_mapping(&self, fail: bool) {
        self.with(|s| s.fail_remove_mapping = fail);
    }

    /// Refuse loop attach with PermissionDenied until `escalate` is called.
    /// `allowed` decides whether escalation is possible at all.
    pub fn require_escalation(&self, allowed: bool) {
        self.with(|s| s.escalation = Some(allowed));
    }

    pub fn is_escalated(&self) -> bool {
        self.with(|s| s.escalated)
    }

    /// Leave a mapping behind as if from an earlier crashed run
    pub fn preexisting_mapping(&self, name: &str) {
        self.with(|s| {
            s.mappings.insert(name.to_string(), String::new());
        });
    }

    pub fn operations(&self) -> Vec<String> {
        self.with(|s| s.operations.clone())
    }

    pub fn bound_loops(&self) -> Vec<u32> {
        self.with(|s| s.loops.keys().copied().collect())
    }

    pub fn mapping_names(&self) -> Vec<String> {
        self.with(|s| s.mappings.keys().cloned().collect())
    }

    pub fn mapping_table(&self, name: &str) -> Option<String> {
        self.with(|s| s.mappings.get(name).cloned())
    }

    /// No loops, mappings or mounts remain
    pub fn is_clean(&self) -> bool {
        self.with(|s| s.loops.is_empty() && s.mappings.is_empty() && s.mounts.is_empty())
    }
}

impl DeviceControl for FakeDeviceControl {
    fn available_bytes(&self, _dir: &Path) -> ControlResult<u64> {
        Ok(self.with(|s| s.available_bytes))
    }

    fn next_free_loop(&self) -> ControlResult<Option<u32>> {
        Ok(self.with(|s| (0..).find(|slot| !s.loops.contains_key(slot))))
    }

    fn loop_slot_bound(&self, slot: u32) -> bool {
        self.with(|s| s.loops.contains_key(&slot))
    }

    fn attach_loop(&self, slot: u32, backing: &Path) -> ControlResult<()> {
        self.with(|s| {
            if s.escalation.is_some() && !s.escalated {
                s.operations.push(format!("denied loop{}", slot));
                return Err(ControlError::PermissionDenied(format!(
                    "loop{}: Permission denied",
                    slot
                )));
            }
            if s.loops.contains_key(&slot) {
                return Err(ControlError::Busy(format!("loop{}", slot)));
            }
            s.loops.insert(slot, backing.to_path_buf());
            s.operations.push(format!("attach loop{}", slot));
            Ok(())
        })
    }

    fn detach_loop(&self, device: &Path) -> ControlResult<()> {
        let slot = device
            .to_str()
            .and_then(loopdev::parse_loop_slot)
            .ok_or_else(|| ControlError::NotFound(device.display().to_string()))?;
        self.with(|s| {
            if !s.loops.contains_key(&slot) {
                return Err(ControlError::NotFound(device.display().to_string()));
            }
            let name = device.display().to_string();
            if s.mappings.values().any(|table| table.contains(&name)) {
                return Err(ControlError::Busy(format!("{} is held by a mapping", name)));
            }
            s.loops.remove(&slot);
            s.operations.push(format!("detach {}", name));
            Ok(())
        })
    }

    fn create_mapping(&self, name: &str, table: &str) -> ControlResult<()> {
        self.with(|s| {
            if s.fail_create_mapping {
                return Err(ControlError::Failed(format!("create {}: ioctl failed", name)));
            }
            if s.mappings.contains_key(name) {
                return Err(ControlError::Busy(format!("{} already exists", name)));
            }
            s.mappings.insert(name.to_string(), table.to_string());
            s.operations.push(format!("create {}", name));
            Ok(())
        })
    }

    fn remove_mapping(&self, name: &str) -> ControlResult<()> {
        self.with(|s| {
            if !s.mappings.contains_key(name) {
                return Err(ControlError::NotFound(name.to_string()));
            }
            if s.fail_remove_mapping {
                return Err(ControlError::Failed(format!("remove {}: ioctl failed", name)));
            }
            let device = mapped_device_path(name);
            if s.mounts.values().any(|d| d == &device) {
                return Err(ControlError::Busy(format!("{} is mounted", name)));
            }
            s.mappings.remove(name);
            s.operations.push(format!("remove {}", name));
            Ok(())
        })
    }

    fn mapping_exists(&self, name: &str) -> bool {
        self.with(|s| s.mappings.contains_key(name))
    }

    fn format(&self, device: &Path, filesystem: &str) -> ControlResult<()> {
        self.with(|s| {
            if s.fail_format {
                return Err(ControlError::Failed(format!("mkfs.{} failed", filesystem)));
            }
            s.formatted.insert(device.to_path_buf());
            s.operations
                .push(format!("format {} {}", device.display(), filesystem));
            Ok(())
        })
    }

    fn mount(&self, device: &Path, mount_point: &Path, _filesystem: &str) -> ControlResult<()> {
        self.with(|s| {
            if s.fail_mount || !s.formatted.contains(device) {
                return Err(ControlError::Failed(format!(
                    "mount {}: wrong fs type",
                    device.display()
                )));
            }
            s.mounts
                .insert(mount_point.to_path_buf(), device.to_path_buf());
            s.operations.push(format!("mount {}", mount_point.display()));
            Ok(())
        })
    }

    fn unmount(&self, mount_point: &Path) -> ControlResult<()> {
        self.with(|s| {
            if s.mounts.remove(mount_point).is_none() {
                return Err(ControlError::NotFound(mount_point.display().to_string()));
            }
            s.operations
                .push(format!("unmount {}", mount_point.display()));
            Ok(())
        })
    }

    fn is_mounted(&self, mount_point: &Path) -> bool {
        self.with(|s| s.mounts.contains_key(mount_point))
    }

    fn can_escalate(&self) -> bool {
        self.with(|s| s.escalation == Some(true) && !s.escalated)
    }

    fn escalate(&self) -> bool {
        self.with(|s| {
            if s.escalation != Some(true) || s.escalated {
                return false;
            }
            s.escalated = true;
            s.operations.push("escalate".to_string());
            true
        })
    }
}
