//! Run orchestration.
//!
//! `Setup -> Running -> Finalizing -> Done`, with an interrupt edge from any
//! state into `Finalizing`. Finalizing always runs workers, then monitor,
//! then fault device, and it runs exactly once per run: the first caller wins
//! a compare-and-set and every later call (including `Drop`) is a no-op.

use crate::config::types::{Result, RunConfig, StressError, WorkerCategory};
use crate::config::validator::validate_config;
use crate::exec::launcher::{LaunchRequest, WorkerLauncher};
use crate::exec::registry::{WorkerId, WorkerRegistry, WorkerSummary};
use crate::exec::shutdown::{run_shutdown_protocol, ShutdownReport};
use crate::fault::device::{FaultDevice, VirtualBlockDeviceBuilder};
use crate::kernel::control::DeviceControl;
use crate::kernel::signal::InterruptSource;
use crate::monitor::classifier::{default_rules, RuleSet};
use crate::monitor::kernel_log::{KernelLogMonitor, MonitorReport};
use crate::monitor::source::{open_source, LogSource};
use crate::monitor::ticker::{IntervalTicker, Ticker};
use crate::observability::progress::{LogProgressSink, ProgressSink};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Name of the machine-readable report inside the run directory
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Setup,
    Running,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No critical kernel events and every requested component ran
    Pass,
    /// Something requested did not run (spawn failure, no fault device, no monitor)
    Degraded,
    /// Critical kernel events were observed
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnFailure {
    pub category: WorkerCategory,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultOutcome {
    pub requested: bool,
    pub device: Option<FaultDevice>,
    pub error: Option<String>,
}

/// Everything a report writer needs; serialised as `summary.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested_duration_secs: u64,
    pub elapsed_ms: u64,
    pub final_state: RunState,
    pub interrupted: bool,
    pub signal: Option<i32>,
    pub verdict: Verdict,
    pub critical_categories: Vec<String>,
    pub config_warnings: Vec<String>,
    pub fault: FaultOutcome,
    pub spawn_failures: Vec<SpawnFailure>,
    pub workers: Vec<WorkerSummary>,
    pub shutdown: ShutdownReport,
    pub monitor: Option<MonitorReport>,
    pub teardown_warnings: Vec<String>,
}

impl RunReport {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StressError::Config(format!("serialize report: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub struct Orchestrator {
    config: RunConfig,
    launcher: Arc<dyn WorkerLauncher>,
    control: Arc<dyn DeviceControl>,
    interrupt: Arc<dyn InterruptSource>,
    privileged: bool,
    rules: Option<RuleSet>,
    log_source: Option<Box<dyn LogSource>>,
    ticker: Option<Box<dyn Ticker>>,
    sink: Option<Box<dyn ProgressSink>>,

    state: RunState,
    finalize_started: AtomicBool,
    run_id: String,
    run_dir: Option<PathBuf>,
    started_at: DateTime<Utc>,
    started: Instant,
    registry: Arc<WorkerRegistry>,
    fault_builder: Option<VirtualBlockDeviceBuilder>,
    monitor: Option<KernelLogMonitor>,

    config_warnings: Vec<String>,
    fault: FaultOutcome,
    spawn_failures: Vec<SpawnFailure>,
    monitor_failed: bool,
    shutdown: Option<ShutdownReport>,
    monitor_report: Option<MonitorReport>,
    teardown_warnings: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        config: RunConfig,
        launcher: Arc<dyn WorkerLauncher>,
        control: Arc<dyn DeviceControl>,
        interrupt: Arc<dyn InterruptSource>,
    ) -> Self {
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            config,
            launcher,
            control,
            interrupt,
            privileged: nix::unistd::geteuid().is_root(),
            rules: None,
            log_source: None,
            ticker: None,
            sink: None,
            state: RunState::Setup,
            finalize_started: AtomicBool::new(false),
            run_id,
            run_dir: None,
            started_at: Utc::now(),
            started: Instant::now(),
            registry: Arc::new(WorkerRegistry::new()),
            fault_builder: None,
            monitor: None,
            config_warnings: Vec::new(),
            fault: FaultOutcome::default(),
            spawn_failures: Vec::new(),
            monitor_failed: false,
            shutdown: None,
            monitor_report: None,
            teardown_warnings: Vec::new(),
        }
    }

    /// Override privilege detection (device control may still escalate)
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_log_source(mut self, source: Box<dyn LogSource>) -> Self {
        self.log_source = Some(source);
        self
    }

    pub fn with_ticker(mut self, ticker: Box<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    pub fn with_progress_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    /// Execute the whole run. Resources are released before this returns,
    /// whichever way the run ended.
    pub fn run(&mut self) -> Result<RunReport> {
        self.started = Instant::now();
        self.started_at = Utc::now();

        let outcome = self.setup().and_then(|()| self.execute());
        self.finalize();
        self.state = RunState::Done;
        outcome?;

        let report = self.build_report();
        if let Some(dir) = &self.run_dir {
            let path = dir.join(SUMMARY_FILE);
            match report.write_json(&path) {
                Ok(()) => info!("Summary written to {}", path.display()),
                Err(e) => warn!("Could not write {}: {}", path.display(), e),
            }
        }
        info!(
            "Run {} done in {}ms: {:?}",
            report.run_id, report.elapsed_ms, report.verdict
        );
        Ok(report)
    }

    fn setup(&mut self) -> Result<()> {
        self.state = RunState::Setup;
        let escalate =
            self.config.fault.enabled && !self.privileged && self.control.can_escalate();
        if escalate {
            warn!("Not running as root; fault device operations will escalate through sudo");
        }
        let validation = validate_config(&self.config, self.privileged || escalate)?;
        for w in &validation.warnings {
            warn!("{}", w);
        }
        self.config_warnings = validation.warnings.clone();

        let run_dir = self.config.output_dir.join(format!(
            "run-{}-{}",
            self.started_at.format("%Y%m%dT%H%M%SZ"),
            self.run_id
        ));
        fs::create_dir_all(run_dir.join("logs"))?;
        info!("Run {} writing to {}", self.run_id, run_dir.display());
        self.run_dir = Some(run_dir.clone());

        self.fault.requested = self.config.fault.enabled;
        if self.config.fault.enabled && !validation.disable_fault_injection {
            if self.interrupt.interrupted() {
                return Ok(());
            }
            self.build_fault_device(&run_dir);
        }
        Ok(())
    }

    fn build_fault_device(&mut self, run_dir: &Path) {
        let mut builder = VirtualBlockDeviceBuilder::new(
            Arc::clone(&self.control),
            self.config.fault.clone(),
            run_dir.to_path_buf(),
        );
        match builder.build() {
            Ok(device) => {
                info!(
                    "Fault injection active on {} (errors in sectors [{}, +{}))",
                    device.mapped_device.display(),
                    device.error_start,
                    device.error_len
                );
                self.fault.device = Some(device);
            }
            Err(e) => {
                if !e.is_fault_injection_recoverable() {
                    error!("Unexpected fault setup error: {}", e);
                }
                warn!("Continuing without fault injection: {}", e);
                self.fault.error = Some(e.to_string());
            }
        }
        // kept even on failure so teardown can retry leftovers
        self.fault_builder = Some(builder);
    }

    fn execute(&mut self) -> Result<()> {
        if self.interrupt.interrupted() {
            info!("Interrupted during setup");
            return Ok(());
        }
        self.state = RunState::Running;

        self.start_workers();
        if self.interrupt.interrupted() {
            return Ok(());
        }
        self.start_monitor();

        let duration = self.config.duration();
        info!("Running for {:?} (Ctrl-C to stop early)", duration);
        if self.interrupt.wait_timeout(duration) {
            info!("Interrupt received, finalizing");
        }
        Ok(())
    }

    fn requests(&self, log_dir: &Path) -> Vec<LaunchRequest> {
        let cfg = &self.config;
        let duration = cfg.duration_secs;
        let mut requests = Vec::new();

        for i in 0..cfg.memory.workers {
            requests.push(
                LaunchRequest::new(WorkerCategory::Memory, i, log_dir.to_path_buf())
                    .param("bytes", cfg.memory.bytes_per_worker)
                    .param("duration", duration),
            );
        }

        let churn_root = cfg
            .file_churn
            .target_dir
            .clone()
            .or_else(|| self.mounted_fault_dir())
            .unwrap_or_else(|| log_dir.with_file_name("churn"));
        for i in 0..cfg.file_churn.workers {
            let dir = churn_root.join(format!("{}-churn-{}", self.run_id, i));
            let mut request =
                LaunchRequest::new(WorkerCategory::FileChurn, i, log_dir.to_path_buf())
                    .param("directory", dir.display())
                    .param("files", cfg.file_churn.files_per_worker)
                    .param("file_size", cfg.file_churn.file_size)
                    .param("duration", duration);
            request.scratch.push(dir);
            requests.push(request);
        }

        if cfg.io.workers > 0 {
            match self.io_target() {
                Some(target) => {
                    // a raw fault device is exercised across its whole size
                    let size = match &self.fault.device {
                        Some(device) if device.mapped_device == target => device.size_bytes(),
                        _ => cfg.io.size,
                    };
                    for i in 0..cfg.io.workers {
                        requests.push(
                            LaunchRequest::new(WorkerCategory::Io, i, log_dir.to_path_buf())
                                .param("target", target.display())
                                .param("block_size", cfg.io.block_size)
                                .param("queue_depth", cfg.io.queue_depth)
                                .param("size", size)
                                .param("duration", duration),
                        );
                    }
                }
                None => warn!("No I/O target available; skipping io workers"),
            }
        }

        if let (true, Some(interval)) = (cfg.monitor.enabled, cfg.monitor.vmstat_interval_secs) {
            requests.push(
                LaunchRequest::new(WorkerCategory::Monitor, 0, log_dir.to_path_buf())
                    .param("interval", interval)
                    .param("duration", duration),
            );
        }

        for (i, custom) in cfg.custom.iter().enumerate() {
            let mut request =
                LaunchRequest::new(WorkerCategory::Custom, i as u32, log_dir.to_path_buf())
                    .param("duration", duration);
            request.label = format!("custom-{}", custom.name);
            request.command = Some(custom.command.clone());
            requests.push(request);
        }
        requests
    }

    fn mounted_fault_dir(&self) -> Option<PathBuf> {
        self.fault
            .device
            .as_ref()
            .filter(|d| d.mounted)
            .and_then(|d| d.mount_point.clone())
    }

    /// Mounted fault filesystem, then the raw mapped device, then io.target
    fn io_target(&self) -> Option<PathBuf> {
        if let Some(device) = &self.fault.device {
            return Some(match self.mounted_fault_dir() {
                Some(dir) => dir.join(format!("{}-io.dat", self.run_id)),
                None => device.io_target(),
            });
        }
        self.config.io.target.clone()
    }

    fn start_workers(&mut self) {
        let Some(run_dir) = self.run_dir.clone() else {
            return;
        };
        let requests = self.requests(&run_dir.join("logs"));
        if self.config.io.workers > 0 && self.io_target().is_none() {
            self.spawn_failures.push(SpawnFailure {
                category: WorkerCategory::Io,
                reason: "no I/O target available".to_string(),
            });
        }

        for request in requests {
            if self.interrupt.interrupted() {
                info!("Interrupted while starting workers");
                return;
            }
            if self
                .spawn_failures
                .iter()
                .any(|f| f.category == request.category)
            {
                continue;
            }

            for dir in &request.scratch {
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!("Cannot create {}: {}", dir.display(), e);
                }
            }

            let launcher = Arc::clone(&self.launcher);
            match self
                .registry
                .spawn_registered(request.category, || launcher.launch(&request))
            {
                Ok(_) => {}
                Err(StressError::RegistryClosed) => return,
                Err(e) => {
                    warn!(
                        "{} workers disabled for this run: {}",
                        request.category, e
                    );
                    self.spawn_failures.push(SpawnFailure {
                        category: request.category,
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!("{} worker(s) running", self.registry.len());
    }

    fn start_monitor(&mut self) {
        if !self.config.monitor.enabled {
            return;
        }
        let rules = match self.rules.take() {
            Some(rules) => Ok(rules),
            None => default_rules(),
        };
        let rules = match rules {
            Ok(rules) => rules.with_default_detail_limit(self.config.monitor.detail_limit),
            Err(e) => {
                warn!("Kernel log monitor disabled: {}", e);
                self.monitor_failed = true;
                return;
            }
        };

        let source = self
            .log_source
            .take()
            .unwrap_or_else(|| open_source(&self.config.monitor.source));
        let ticker = self
            .ticker
            .take()
            .unwrap_or_else(|| Box::new(IntervalTicker::new(self.config.monitor_interval())));
        let sink = self
            .sink
            .take()
            .unwrap_or_else(|| Box::new(LogProgressSink));

        let expected = self
            .fault
            .device
            .as_ref()
            .map(FaultDevice::kernel_names)
            .unwrap_or_default();
        let mut monitor = KernelLogMonitor::new(
            source,
            Arc::new(rules),
            sink,
            ticker,
            self.config.monitor.progress_every,
        )
        .with_expected_devices(expected);
        match monitor.start() {
            Ok(()) => self.monitor = Some(monitor),
            Err(e) => {
                warn!("Kernel log monitor failed to start: {}", e);
                self.monitor_failed = true;
            }
        }
    }

    /// Workers, then monitor, then fault device. Runs at most once.
    pub fn finalize(&mut self) {
        if self
            .finalize_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.state = RunState::Finalizing;
        info!("Finalizing run {}", self.run_id);

        let shutdown = run_shutdown_protocol(&self.registry, self.config.grace_period());
        let unreaped = shutdown.unreaped.clone();
        self.shutdown = Some(shutdown);

        if let Some(mut monitor) = self.monitor.take() {
            self.monitor_report = Some(monitor.stop());
        }

        self.release_fault_device(&unreaped);
        if !self.teardown_warnings.is_empty() {
            warn!(
                "Teardown left {} warning(s); leftover devices may need manual removal",
                self.teardown_warnings.len()
            );
        }
    }

    /// Tear the fault device down, unless a worker that may still hold it
    /// has not been confirmed dead
    fn release_fault_device(&mut self, unreaped: &[WorkerId]) {
        let Some(builder) = self.fault_builder.as_mut() else {
            return;
        };
        if builder.is_released() {
            return;
        }
        if !unreaped.is_empty() {
            let warning = format!(
                "fault device left in place: workers {:?} not confirmed terminated; \
                 run `stressbox cleanup` once they are gone",
                unreaped
            );
            error!("{}", warning);
            self.teardown_warnings.push(warning);
            return;
        }
        self.teardown_warnings.extend(builder.teardown());
    }

    fn build_report(&self) -> RunReport {
        let shutdown = self.shutdown.clone().unwrap_or_default();
        let critical_categories: Vec<String> = self
            .monitor_report
            .as_ref()
            .map(|m| {
                m.counters
                    .critical_categories()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let degraded = !self.spawn_failures.is_empty()
            || self.monitor_failed
            || (self.fault.requested && self.fault.device.is_none());
        let verdict = if !critical_categories.is_empty() {
            Verdict::Fail
        } else if degraded {
            Verdict::Degraded
        } else {
            Verdict::Pass
        };

        RunReport {
            run_id: self.run_id.clone(),
            run_dir: self.run_dir.clone().unwrap_or_default(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            requested_duration_secs: self.config.duration_secs,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            final_state: RunState::Done,
            interrupted: self.interrupt.interrupted(),
            signal: self.interrupt.signal(),
            verdict,
            critical_categories,
            config_warnings: self.config_warnings.clone(),
            fault: self.fault.clone(),
            spawn_failures: self.spawn_failures.clone(),
            workers: shutdown.workers.clone(),
            shutdown,
            monitor: self.monitor_report.clone(),
            teardown_warnings: self.teardown_warnings.clone(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if !self.finalize_started.load(Ordering::SeqCst) {
            warn!("Run {} abandoned before finalizing; cleaning up", self.run_id);
        }
        self.finalize();
    }
}
