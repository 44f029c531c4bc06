/// Resource ledger and idempotent cleanup
///
/// Resources are recorded the moment they are acquired and released in
/// reverse acquisition order. A successful (or already-absent) release drops
/// the entry; a failed release keeps it so a later pass can retry. Cleanup
/// never returns an error, it accumulates warnings.
use crate::kernel::control::{ControlError, DeviceControl};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Resource types that need cleanup
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    BackingFile,
    LoopDevice,
    MappedDevice,
    Mount,
    /// Directory created to mount on; removed only when empty
    MountPoint,
}

/// Resource ledger entry
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub resource_type: ResourceType,
    pub identifier: String,
    pub path: PathBuf,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Ordered record of acquired resources
#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<ResourceEntry>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record resource creation.
    /// Must be called immediately after successful creation
    pub fn record(&mut self, resource_type: ResourceType, identifier: String, path: PathBuf) {
        let entry = ResourceEntry {
            resource_type,
            identifier,
            path,
            created_at: chrono::Utc::now(),
        };

        debug!("Recording resource: {:?}", entry);
        self.entries.push(entry);
    }

    pub fn get_by_type(&self, resource_type: &ResourceType) -> Vec<&ResourceEntry> {
        self.entries
            .iter()
            .filter(|e| &e.resource_type == resource_type)
            .collect()
    }

    pub fn contains(&self, resource_type: &ResourceType) -> bool {
        self.entries.iter().any(|e| &e.resource_type == resource_type)
    }

    /// Entries in reverse creation order (for cleanup)
    pub fn reverse_order(&self) -> Vec<ResourceEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn remove(&mut self, resource_type: &ResourceType, identifier: &str) {
        self.entries
            .retain(|e| !(&e.resource_type == resource_type && e.identifier == identifier));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Release every ledger entry in reverse order.
///
/// Each step is attempted even when an earlier one failed.
pub fn cleanup_all(ledger: &mut ResourceLedger, control: &dyn DeviceControl) -> Vec<String> {
    if ledger.is_empty() {
        debug!("Cleanup: nothing recorded");
        return Vec::new();
    }

    info!("Starting cleanup of {} resources", ledger.count());
    let mut warnings = Vec::new();

    for entry in ledger.reverse_order() {
        match release(&entry, control) {
            Ok(()) => {
                debug!("Released {:?} {}", entry.resource_type, entry.identifier);
                ledger.remove(&entry.resource_type, &entry.identifier);
            }
            Err(msg) => {
                let msg = format!(
                    "Failed to release {:?} {}: {}",
                    entry.resource_type, entry.identifier, msg
                );
                warn!("{}", msg);
                warnings.push(msg);
            }
        }
    }

    if warnings.is_empty() {
        info!("Cleanup complete");
    } else {
        warn!("Cleanup finished with {} warning(s)", warnings.len());
    }
    warnings
}

/// Release one resource; absence counts as released
fn release(entry: &ResourceEntry, control: &dyn DeviceControl) -> Result<(), String> {
    let outcome = match entry.resource_type {
        ResourceType::Mount => {
            if !control.is_mounted(&entry.path) {
                debug!("Mount already cleaned: {}", entry.path.display());
                return Ok(());
            }
            control.unmount(&entry.path)
        }
        ResourceType::MappedDevice => control.remove_mapping(&entry.identifier),
        ResourceType::LoopDevice => control.detach_loop(&entry.path),
        ResourceType::BackingFile => return remove_file_if_present(&entry.path),
        ResourceType::MountPoint => return remove_empty_dir(&entry.path),
    };

    match outcome {
        Ok(()) | Err(ControlError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

fn remove_file_if_present(path: &Path) -> Result<(), String> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("remove {}: {}", path.display(), e)),
    }
}

fn remove_empty_dir(path: &Path) -> Result<(), String> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("rmdir {}: {}", path.display(), e)),
    }
}

/// Remove a scratch directory tree; a symlinked root is unlinked, not followed
pub fn remove_tree(path: &Path) -> Result<(), String> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(format!("stat {}: {}", path.display(), e)),
    };

    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("remove {}: {}", path.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_ledger() {
        let mut ledger = ResourceLedger::new();
        assert!(ledger.is_empty());

        ledger.record(
            ResourceType::BackingFile,
            "backing".to_string(),
            PathBuf::from("/tmp/backing.img"),
        );
        ledger.record(
            ResourceType::LoopDevice,
            "loop3".to_string(),
            PathBuf::from("/dev/loop3"),
        );

        assert_eq!(ledger.count(), 2);
        assert_eq!(ledger.get_by_type(&ResourceType::LoopDevice).len(), 1);
        let order: Vec<_> = ledger
            .reverse_order()
            .into_iter()
            .map(|e| e.resource_type)
            .collect();
        assert_eq!(order, vec![ResourceType::LoopDevice, ResourceType::BackingFile]);

        ledger.remove(&ResourceType::LoopDevice, "loop3");
        assert!(!ledger.contains(&ResourceType::LoopDevice));
    }

    #[test]
    fn remove_tree_handles_missing_and_nested() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("churn-0");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/f"), b"x").unwrap();

        assert!(remove_tree(&root).is_ok());
        assert!(!root.exists());
        assert!(remove_tree(&root).is_ok());
    }

    #[test]
    fn remove_tree_does_not_follow_symlinked_root() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("keep");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("precious"), b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(remove_tree(&link).is_ok());
        assert!(!link.exists());
        assert!(target.join("precious").exists());
    }
}
