/// Core types shared by every stressbox subsystem
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Category of a background worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkerCategory {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "file-churn")]
    FileChurn,
    #[serde(rename = "io")]
    Io,
    #[serde(rename = "monitor")]
    Monitor,
    #[serde(rename = "custom")]
    Custom,
}

impl WorkerCategory {
    pub const ALL: [WorkerCategory; 5] = [
        WorkerCategory::Memory,
        WorkerCategory::FileChurn,
        WorkerCategory::Io,
        WorkerCategory::Monitor,
        WorkerCategory::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerCategory::Memory => "memory",
            WorkerCategory::FileChurn => "file-churn",
            WorkerCategory::Io => "io",
            WorkerCategory::Monitor => "monitor",
            WorkerCategory::Custom => "custom",
        }
    }
}

impl fmt::Display for WorkerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy for stressbox
///
/// Fault-injection variants (`Allocation`, `NoFreeSlot`, `Permission`, `Mapping`)
/// are always recovered by running without injection. `WorkerSpawn` is isolated
/// to one category. `MonitorRead` is transient. `ShutdownTimeout` only triggers
/// escalation. `Config` aborts a run before any resource is acquired.
#[derive(Error, Debug)]
pub enum StressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backing store allocation failed: {0}")]
    Allocation(String),

    #[error("No free loop device slot after scanning {scanned} candidates")]
    NoFreeSlot { scanned: u32 },

    #[error("Permission error: {0}")]
    Permission(String),

    #[error("Device mapping error: {0}")]
    Mapping(String),

    #[error("Failed to spawn {category} worker: {reason}")]
    WorkerSpawn {
        category: WorkerCategory,
        reason: String,
    },

    #[error("Kernel log read error: {0}")]
    MonitorRead(String),

    #[error("{} worker(s) still alive after {waited:?} grace period", .survivors.len())]
    ShutdownTimeout { survivors: Vec<u64>, waited: Duration },

    #[error("Registry is closed for shutdown")]
    RegistryClosed,
}

impl StressError {
    /// Errors that only disable fault injection, never the whole run
    pub fn is_fault_injection_recoverable(&self) -> bool {
        matches!(
            self,
            StressError::Allocation(_)
                | StressError::NoFreeSlot { .. }
                | StressError::Permission(_)
                | StressError::Mapping(_)
                | StressError::Io(_)
        )
    }
}

impl From<nix::errno::Errno> for StressError {
    fn from(err: nix::errno::Errno) -> Self {
        StressError::Io(std::io::Error::from(err))
    }
}

/// Result type alias for stressbox operations
pub type Result<T> = std::result::Result<T, StressError>;

/// Memory pressure load
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLoad {
    /// Number of memory worker processes
    pub workers: u32,
    /// Bytes each worker keeps resident
    pub bytes_per_worker: u64,
}

impl Default for MemoryLoad {
    fn default() -> Self {
        Self {
            workers: 0,
            bytes_per_worker: 256 * 1024 * 1024,
        }
    }
}

/// Mass file creation/deletion load
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileChurnLoad {
    pub workers: u32,
    /// Parent directory for per-worker scratch directories (run dir when unset)
    pub target_dir: Option<PathBuf>,
    pub files_per_worker: u32,
    pub file_size: u64,
}

impl Default for FileChurnLoad {
    fn default() -> Self {
        Self {
            workers: 0,
            target_dir: None,
            files_per_worker: 1000,
            file_size: 64 * 1024,
        }
    }
}

/// Block I/O load
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IoLoad {
    pub workers: u32,
    pub block_size: u64,
    pub queue_depth: u32,
    /// Bytes each job touches
    pub size: u64,
    /// Target used when no fault device is active
    pub target: Option<PathBuf>,
}

impl Default for IoLoad {
    fn default() -> Self {
        Self {
            workers: 0,
            block_size: 4096,
            queue_depth: 16,
            size: 256 * 1024 * 1024,
            target: None,
        }
    }
}

/// Arbitrary user-provided worker
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CustomWorker {
    pub name: String,
    pub command: Vec<String>,
}

/// Synthetic fault device settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    pub enabled: bool,
    /// Directory holding the backing file (run dir when unset)
    pub backing_dir: Option<PathBuf>,
    pub size_bytes: u64,
    /// First sector of the error segment
    pub error_start_sector: u64,
    /// Length of the error segment in sectors
    pub error_sectors: u64,
    /// Device-mapper name for the mapped device
    pub device_name: String,
    /// Format and mount the mapped device here when set
    pub mount_point: Option<PathBuf>,
    pub filesystem: String,
    /// Highest loop slot index considered during the linear scan
    pub max_loop_slots: u32,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backing_dir: None,
            size_bytes: 1024 * 1024 * 1024,
            error_start_sector: 1024 * 1024,
            error_sectors: 2048,
            device_name: "stressbox-faulty".to_string(),
            mount_point: None,
            filesystem: "ext4".to_string(),
            max_loop_slots: 256,
        }
    }
}

/// Where the kernel log is read from
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogSourceKind {
    /// `/dev/kmsg` record interface
    Kmsg,
    /// Plain text log such as `/var/log/kern.log`
    File { path: PathBuf },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub source: LogSourceKind,
    pub interval_ms: u64,
    /// Emit a progress snapshot every this many ticks
    pub progress_every: u64,
    /// Per-category bound on retained matching lines
    pub detail_limit: Option<usize>,
    /// Spawn `vmstat` as a monitor-category worker with this period
    pub vmstat_interval_secs: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: LogSourceKind::Kmsg,
            interval_ms: 1000,
            progress_every: 30,
            detail_limit: Some(100),
            vmstat_interval_secs: None,
        }
    }
}

/// Immutable run configuration snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub duration_secs: u64,
    /// Grace period between SIGTERM and SIGKILL escalation
    pub grace_period_ms: u64,
    pub output_dir: PathBuf,
    pub memory: MemoryLoad,
    pub file_churn: FileChurnLoad,
    pub io: IoLoad,
    pub custom: Vec<CustomWorker>,
    pub fault: FaultConfig,
    pub monitor: MonitorConfig,
    /// Per-category argv overrides for the load generators
    pub templates: BTreeMap<WorkerCategory, Vec<String>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            grace_period_ms: 5000,
            output_dir: std::env::temp_dir().join("stressbox"),
            memory: MemoryLoad::default(),
            file_churn: FileChurnLoad::default(),
            io: IoLoad::default(),
            custom: Vec::new(),
            fault: FaultConfig::default(),
            monitor: MonitorConfig::default(),
            templates: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.interval_ms)
    }

    /// Load a JSON config file
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StressError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| StressError::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    pub fn total_workers(&self) -> u32 {
        self.memory.workers
            + self.file_churn.workers
            + self.io.workers
            + self.custom.len() as u32
            + u32::from(self.monitor.vmstat_interval_secs.is_some())
    }
}

/// Parse a human size such as `512M`, `1G`, `4k` or a plain byte count
pub fn parse_size(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StressError::Config("empty size".to_string()));
    }

    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let mult: u64 = match c.to_ascii_lowercase() {
                'k' => 1024,
                'm' => 1024 * 1024,
                'g' => 1024 * 1024 * 1024,
                't' => 1024 * 1024 * 1024 * 1024,
                _ => {
                    return Err(StressError::Config(format!(
                        "unknown size suffix in '{}'",
                        raw
                    )))
                }
            };
            (&trimmed[..idx], mult)
        }
        _ => (trimmed, 1),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| StressError::Config(format!("invalid size '{}'", raw)))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| StressError::Config(format!("size '{}' overflows", raw)))
}
