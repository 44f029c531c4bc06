//! Virtual block device with a deterministic error segment.
//!
//! Acquisition order is backing file -> loop binding -> mapped device ->
//! mount point -> mount. Each step is recorded in a [`ResourceLedger`] as soon
//! as it succeeds, and [`VirtualBlockDeviceBuilder::teardown`] walks the ledger
//! backwards. A mapped device cannot be removed while mounted and a loop device
//! cannot be detached while a mapping references it, so the reverse order is
//! load-bearing.

use crate::config::types::{FaultConfig, Result, StressError};
use crate::fault::backing;
use crate::kernel::control::{mapped_device_path, ControlError, DeviceControl};
use crate::kernel::devmapper::{self, ErrorTable, SECTOR_SIZE};
use crate::kernel::loopdev;
use crate::safety::cleanup::{self, ResourceLedger, ResourceType};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Descriptor of the active fault device
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FaultDevice {
    pub backing_path: PathBuf,
    pub loop_device: PathBuf,
    pub mapped_device: PathBuf,
    pub total_sectors: u64,
    pub error_start: u64,
    pub error_len: u64,
    pub mount_point: Option<PathBuf>,
    pub mounted: bool,
}

impl FaultDevice {
    /// Where I/O workers should aim: the filesystem when mounted, else the raw device
    pub fn io_target(&self) -> PathBuf {
        match (&self.mount_point, self.mounted) {
            (Some(mp), true) => mp.clone(),
            _ => self.mapped_device.clone(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors * SECTOR_SIZE
    }

    /// Names the kernel log uses for the mapped device: the mapper name and,
    /// when the node resolves, the `dm-N` name behind it
    pub fn kernel_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let candidates = [
            Some(self.mapped_device.clone()),
            fs::canonicalize(&self.mapped_device).ok(),
        ];
        for path in candidates.into_iter().flatten() {
            if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

pub struct VirtualBlockDeviceBuilder {
    control: Arc<dyn DeviceControl>,
    config: FaultConfig,
    workdir: PathBuf,
    ledger: ResourceLedger,
    backing_path: Option<PathBuf>,
    loop_device: Option<PathBuf>,
    mapped_device: Option<PathBuf>,
    table: Option<ErrorTable>,
    mount_point: Option<PathBuf>,
    mounted: bool,
}

impl VirtualBlockDeviceBuilder {
    /// `workdir` holds the backing file unless `config.backing_dir` is set
    pub fn new(control: Arc<dyn DeviceControl>, config: FaultConfig, workdir: PathBuf) -> Self {
        Self {
            control,
            config,
            workdir,
            ledger: ResourceLedger::new(),
            backing_path: None,
            loop_device: None,
            mapped_device: None,
            table: None,
            mount_point: None,
            mounted: false,
        }
    }

    fn backing_file_path(&self) -> PathBuf {
        self.config
            .backing_dir
            .as_ref()
            .unwrap_or(&self.workdir)
            .join(format!("{}.img", self.config.device_name))
    }

    pub fn allocate_backing_store(&mut self, size_bytes: u64) -> Result<PathBuf> {
        let path = self.backing_file_path();
        backing::allocate_backing_store(self.control.as_ref(), &path, size_bytes)?;
        self.ledger.record(
            ResourceType::BackingFile,
            path.display().to_string(),
            path.clone(),
        );
        self.backing_path = Some(path.clone());
        Ok(path)
    }

    pub fn bind_loop_device(&mut self, backing_path: &Path) -> Result<PathBuf> {
        let device =
            loopdev::bind_free_slot(self.control.as_ref(), backing_path, self.config.max_loop_slots)?;
        self.ledger.record(
            ResourceType::LoopDevice,
            device.display().to_string(),
            device.clone(),
        );
        self.loop_device = Some(device.clone());
        Ok(device)
    }

    /// Table over the bound loop device
    pub fn build_error_table(
        &self,
        total_sectors: u64,
        error_start: u64,
        error_len: u64,
    ) -> Result<ErrorTable> {
        let device = self.loop_device.as_ref().ok_or_else(|| {
            StressError::Mapping("no loop device bound for the table".to_string())
        })?;
        devmapper::build_error_table(device, total_sectors, error_start, error_len)
    }

    /// Create the mapped device, replacing any stale one of the same name
    pub fn activate(&mut self, table: &ErrorTable) -> Result<PathBuf> {
        let name = self.config.device_name.clone();

        match self.control.remove_mapping(&name) {
            Ok(()) => warn!("Removed stale mapped device {}", name),
            Err(ControlError::NotFound(_)) => {}
            Err(e) => {
                return Err(StressError::Mapping(format!(
                    "cannot remove stale mapping {}: {}",
                    name, e
                )))
            }
        }

        self.control
            .create_mapping(&name, &table.render())
            .map_err(|e| StressError::Mapping(format!("create {}: {}", name, e)))?;

        let path = mapped_device_path(&name);
        self.ledger
            .record(ResourceType::MappedDevice, name.clone(), path.clone());
        self.mapped_device = Some(path.clone());
        self.table = Some(table.clone());

        let (start, len) = table.error_range();
        info!(
            "Activated {} ({} sectors, error segment [{}, +{}))",
            path.display(),
            table.total_sectors,
            start,
            len
        );
        Ok(path)
    }

    /// Best-effort filesystem on the mapped device.
    /// Failure leaves the raw device usable and returns false.
    pub fn format_and_mount(&mut self, mapped_device: &Path, mount_point: &Path) -> bool {
        let filesystem = self.config.filesystem.clone();

        if let Err(e) = self.control.format(mapped_device, &filesystem) {
            warn!(
                "Formatting {} as {} failed, continuing with raw device: {}",
                mapped_device.display(),
                filesystem,
                e
            );
            return false;
        }

        if !mount_point.exists() {
            if let Err(e) = fs::create_dir_all(mount_point) {
                warn!(
                    "Cannot create mount point {}: {}",
                    mount_point.display(),
                    e
                );
                return false;
            }
            self.ledger.record(
                ResourceType::MountPoint,
                mount_point.display().to_string(),
                mount_point.to_path_buf(),
            );
        }

        if let Err(e) = self.control.mount(mapped_device, mount_point, &filesystem) {
            warn!(
                "Mounting {} at {} failed, continuing with raw device: {}",
                mapped_device.display(),
                mount_point.display(),
                e
            );
            return false;
        }

        self.ledger.record(
            ResourceType::Mount,
            mount_point.display().to_string(),
            mount_point.to_path_buf(),
        );
        self.mount_point = Some(mount_point.to_path_buf());
        self.mounted = true;
        info!("Mounted {} at {}", mapped_device.display(), mount_point.display());
        true
    }

    /// Full sequence from the config. On any hard failure the partial state
    /// is torn down before the error is returned.
    pub fn build(&mut self) -> Result<FaultDevice> {
        match self.build_inner() {
            Ok(device) => Ok(device),
            Err(e) => {
                warn!("Fault device setup failed: {}", e);
                for w in self.teardown() {
                    warn!("Rollback: {}", w);
                }
                Err(e)
            }
        }
    }

    fn build_inner(&mut self) -> Result<FaultDevice> {
        let size = self.config.size_bytes;
        let backing = self.allocate_backing_store(size)?;
        self.bind_loop_device(&backing)?;
        let table = self.build_error_table(
            size / SECTOR_SIZE,
            self.config.error_start_sector,
            self.config.error_sectors,
        )?;
        let mapped = self.activate(&table)?;
        if let Some(mount_point) = self.config.mount_point.clone() {
            self.format_and_mount(&mapped, &mount_point);
        }

        self.device()
            .ok_or_else(|| StressError::Mapping("fault device incomplete".to_string()))
    }

    /// Snapshot of the device, once it has been activated
    pub fn device(&self) -> Option<FaultDevice> {
        let table = self.table.as_ref()?;
        let (error_start, error_len) = table.error_range();
        Some(FaultDevice {
            backing_path: self.backing_path.clone()?,
            loop_device: self.loop_device.clone()?,
            mapped_device: self.mapped_device.clone()?,
            total_sectors: table.total_sectors,
            error_start,
            error_len,
            mount_point: self.mount_point.clone(),
            mounted: self.mounted,
        })
    }

    /// Release everything in reverse acquisition order.
    /// Never fails; returns warnings for steps that could not complete.
    pub fn teardown(&mut self) -> Vec<String> {
        let warnings = cleanup::cleanup_all(&mut self.ledger, self.control.as_ref());

        if !self.ledger.contains(&ResourceType::Mount) {
            self.mounted = false;
        }
        if !self.ledger.contains(&ResourceType::MappedDevice) {
            self.mapped_device = None;
            self.table = None;
        }
        if !self.ledger.contains(&ResourceType::LoopDevice) {
            self.loop_device = None;
        }
        if !self.ledger.contains(&ResourceType::BackingFile) {
            self.backing_path = None;
        }
        warnings
    }

    /// Nothing left to release
    pub fn is_released(&self) -> bool {
        self.ledger.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_device::FakeDeviceControl;

    fn config(mount_point: Option<PathBuf>) -> FaultConfig {
        FaultConfig {
            enabled: true,
            size_bytes: 8 * 1024 * 1024,
            error_start_sector: 4096,
            error_sectors: 128,
            mount_point,
            ..FaultConfig::default()
        }
    }

    #[test]
    fn build_then_teardown_releases_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDeviceControl::new());
        let mp = dir.path().join("mnt");
        let mut builder =
            VirtualBlockDeviceBuilder::new(fake.clone(), config(Some(mp.clone())), dir.path().into());

        let device = builder.build().unwrap();
        assert!(device.mounted);
        assert_eq!(device.total_sectors, 16384);
        assert_eq!((device.error_start, device.error_len), (4096, 128));
        assert_eq!(device.io_target(), mp);
        assert!(device.backing_path.exists());

        let warnings = builder.teardown();
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert!(builder.is_released());
        assert!(!device.backing_path.exists());
        assert!(!mp.exists());

        let ops = fake.operations();
        let pos = |needle: &str| ops.iter().position(|o| o.starts_with(needle)).unwrap();
        assert!(pos("unmount") < pos("remove stressbox-faulty"));
        assert!(ops.iter().rposition(|o| o.starts_with("remove")).unwrap() < pos("detach"));
        assert!(fake.is_clean());
    }

    #[test]
    fn kernel_names_follow_the_mapper_link() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("dm-7");
        fs::write(&node, b"").unwrap();
        let link = dir.path().join("stressbox-faulty");
        std::os::unix::fs::symlink(&node, &link).unwrap();

        let device = FaultDevice {
            backing_path: dir.path().join("stressbox-faulty.img"),
            loop_device: PathBuf::from("/dev/loop0"),
            mapped_device: link,
            total_sectors: 32768,
            error_start: 16384,
            error_len: 256,
            mount_point: None,
            mounted: false,
        };
        assert_eq!(device.kernel_names(), vec!["stressbox-faulty", "dm-7"]);
        assert_eq!(device.size_bytes(), 16 * 1024 * 1024);

        // an unresolvable node still yields the mapper name
        let missing = FaultDevice {
            mapped_device: dir.path().join("gone"),
            ..device
        };
        assert_eq!(missing.kernel_names(), vec!["gone"]);
    }

    #[test]
    fn teardown_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDeviceControl::new());
        let mut builder = VirtualBlockDeviceBuilder::new(
            fake.clone(),
            config(Some(dir.path().join("mnt"))),
            dir.path().into(),
        );
        builder.build().unwrap();

        assert!(builder.teardown().is_empty());
        let ops_after_first = fake.operations().len();
        assert!(builder.teardown().is_empty());
        assert_eq!(fake.operations().len(), ops_after_first);
        assert!(fake.is_clean());
        assert!(builder.device().is_none());
    }

    #[test]
    fn insufficient_space_is_an_allocation_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDeviceControl::new());
        fake.set_available_bytes(500 * 1024 * 1024);
        let mut cfg = config(None);
        cfg.size_bytes = 1024 * 1024 * 1024;
        let mut builder = VirtualBlockDeviceBuilder::new(fake.clone(), cfg, dir.path().into());

        assert!(matches!(builder.build(), Err(StressError::Allocation(_))));
        assert!(builder.is_released());
        assert!(fake.bound_loops().is_empty());
    }

    #[test]
    fn failed_mount_keeps_raw_device() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDeviceControl::new());
        fake.fail_mount(true);
        let mut builder = VirtualBlockDeviceBuilder::new(
            fake.clone(),
            config(Some(dir.path().join("mnt"))),
            dir.path().into(),
        );

        let device = builder.build().unwrap();
        assert!(!device.mounted);
        assert_eq!(device.io_target(), mapped_device_path("stressbox-faulty"));
        assert!(builder.teardown().is_empty());
        assert!(fake.is_clean());
    }

    #[test]
    fn stale_mapping_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDeviceControl::new());
        fake.preexisting_mapping("stressbox-faulty");
        let mut builder =
            VirtualBlockDeviceBuilder::new(fake.clone(), config(None), dir.path().into());

        builder.build().unwrap();
        assert_eq!(fake.mapping_names(), vec!["stressbox-faulty".to_string()]);
        builder.teardown();
        assert!(fake.is_clean());
    }

    #[test]
    fn mapping_failure_rolls_back_loop_and_backing() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDeviceControl::new());
        fake.fail_create_mapping(true);
        let mut builder =
            VirtualBlockDeviceBuilder::new(fake.clone(), config(None), dir.path().into());

        assert!(matches!(builder.build(), Err(StressError::Mapping(_))));
        assert!(builder.is_released());
        assert!(fake.is_clean());
        assert!(!dir.path().join("stressbox-faulty.img").exists());
    }

    #[test]
    fn teardown_continues_past_a_failing_step() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDeviceControl::new());
        let mut builder =
            VirtualBlockDeviceBuilder::new(fake.clone(), config(None), dir.path().into());
        builder.build().unwrap();

        fake.fail_remove_mapping(true);
        let warnings = builder.teardown();
        // mapping removal failed, so the loop detach is refused while referenced,
        // but the backing file step still ran
        assert!(!warnings.is_empty());
        assert!(!dir.path().join("stressbox-faulty.img").exists());

        fake.fail_remove_mapping(false);
        assert!(builder.teardown().is_empty());
        assert!(builder.is_released());
        assert!(fake.is_clean());
    }
}
