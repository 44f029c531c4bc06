//! End-to-end runs of the orchestrator with real worker processes.
//!
//! Load generators are replaced by `sleep`/`sh` templates and the device
//! control by the in-memory fake, so these run unprivileged.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stressbox::config::types::{LogSourceKind, RunConfig, WorkerCategory};
use stressbox::core::orchestrator::{Orchestrator, RunState, Verdict, SUMMARY_FILE};
use stressbox::exec::launcher::TemplateLauncher;
use stressbox::kernel::control::mapped_device_path;
use stressbox::kernel::signal::ManualInterrupt;
use stressbox::monitor::source::FileLogSource;
use stressbox::testing::FakeDeviceControl;

fn launcher(templates: &[(WorkerCategory, &[&str])]) -> Arc<TemplateLauncher> {
    let templates: BTreeMap<WorkerCategory, Vec<String>> = templates
        .iter()
        .map(|(c, argv)| (*c, argv.iter().map(|s| s.to_string()).collect()))
        .collect();
    Arc::new(TemplateLauncher::new(&templates))
}

fn base_config(dir: &Path, duration_secs: u64) -> RunConfig {
    let mut config = RunConfig {
        duration_secs,
        grace_period_ms: 1000,
        output_dir: dir.join("out"),
        ..RunConfig::default()
    };
    config.monitor.interval_ms = 100;
    config.monitor.source = LogSourceKind::File {
        path: dir.join("kern.log"),
    };
    config
}

fn kernel_log(config: &RunConfig) -> PathBuf {
    match &config.monitor.source {
        LogSourceKind::File { path } => path.clone(),
        LogSourceKind::Kmsg => panic!("tests use a file log"),
    }
}

fn append(path: &Path, line: &str) {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(f, "{}", line).unwrap();
}

#[test]
fn five_second_run_with_two_memory_workers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path(), 5);
    config.memory.workers = 2;
    let log = kernel_log(&config);

    let mut orchestrator = Orchestrator::new(
        config,
        launcher(&[(WorkerCategory::Memory, &["sleep", "{duration}"])]),
        Arc::new(FakeDeviceControl::new()),
        Arc::new(ManualInterrupt::new()),
    )
    .with_privileged(false)
    .with_log_source(Box::new(FileLogSource::new(log)));
    let registry = orchestrator.registry();

    let started = Instant::now();
    let report = orchestrator.run().unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(8), "took {:?}", elapsed);
    assert_eq!(orchestrator.state(), RunState::Done);
    assert_eq!(report.workers.len(), 2);
    assert!(report.fault.error.is_none());
    assert!(report.teardown_warnings.is_empty());
    assert!(registry.is_empty());
    assert!(registry.live_ids().is_empty());
    assert_eq!(report.verdict, Verdict::Pass);

    let summary = std::fs::read_to_string(report.run_dir.join(SUMMARY_FILE)).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&summary).unwrap();
    assert_eq!(parsed["workers"].as_array().unwrap().len(), 2);
    assert_eq!(parsed["verdict"], "pass");
}

#[test]
fn interrupt_finishes_within_grace_bound() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path(), 60);
    config.memory.workers = 3;
    config.grace_period_ms = 500;
    let log = kernel_log(&config);
    let interrupt = ManualInterrupt::new();

    let mut orchestrator = Orchestrator::new(
        config,
        // ignores SIGTERM, so the KILL escalation is exercised too
        launcher(&[(
            WorkerCategory::Memory,
            &["sh", "-c", "trap '' TERM; while :; do sleep 0.1; done"],
        )]),
        Arc::new(FakeDeviceControl::new()),
        Arc::new(interrupt.clone()),
    )
    .with_privileged(false)
    .with_log_source(Box::new(FileLogSource::new(log)));

    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(700));
        interrupt.trigger();
        // repeated delivery is harmless
        interrupt.trigger();
    });

    let started = Instant::now();
    let report = orchestrator.run().unwrap();
    trigger.join().unwrap();

    // 0.7s until interrupt + 0.5s grace + kill reap + epsilon
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(report.interrupted);
    assert_eq!(report.workers.len(), 3);
    assert_eq!(report.shutdown.killed, 3);
    assert!(report.workers.iter().all(|w| w.forced_kill));
    assert!(report.shutdown.unreaped.is_empty());
}

#[test]
fn fault_device_is_targeted_and_torn_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path(), 1);
    config.fault.enabled = true;
    config.fault.size_bytes = 16 * 1024 * 1024;
    config.fault.error_start_sector = 8192;
    config.fault.error_sectors = 256;
    config.fault.backing_dir = Some(dir.path().join("backing"));
    config.io.workers = 1;
    config.io.size = 1024 * 1024;
    let log = kernel_log(&config);
    append(&log, "kernel: boot complete");
    let control = Arc::new(FakeDeviceControl::new());

    let mut orchestrator = Orchestrator::new(
        config,
        launcher(&[(
            WorkerCategory::Io,
            &["sh", "-c", "echo {target} {size}; sleep 5"],
        )]),
        control.clone(),
        Arc::new(ManualInterrupt::new()),
    )
    .with_privileged(true)
    .with_log_source(Box::new(FileLogSource::new(log.clone())));

    // errors provoked on the fault device are the point of the run
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(400));
        append(
            &log,
            "Buffer I/O error on dev stressbox-faulty, logical block 1024, async page read",
        );
    });

    let report = orchestrator.run().unwrap();
    writer.join().unwrap();

    let device = report.fault.device.as_ref().expect("fault device built");
    assert_eq!(device.error_start, 8192);
    assert_eq!(device.error_len, 256);
    assert_eq!(device.mapped_device, mapped_device_path("stressbox-faulty"));

    let io_log = report.workers[0].artifact.as_ref().unwrap();
    let written = std::fs::read_to_string(io_log).unwrap();
    // the whole raw device, not io.size, so the error segment is in range
    assert_eq!(written.trim(), "/dev/mapper/stressbox-faulty 16777216");

    let monitor = report.monitor.as_ref().unwrap();
    assert_eq!(monitor.counters.count("io_error"), 1);
    assert_eq!(monitor.counters.expected_events(), 1);
    assert!(report.critical_categories.is_empty());
    assert_eq!(report.verdict, Verdict::Pass);

    assert!(report.teardown_warnings.is_empty());
    assert!(control.is_clean());
    assert!(!device.backing_path.exists());

    // workers are gone before the device is removed
    let ops = control.operations();
    assert_eq!(ops.last().map(String::as_str), Some("detach /dev/loop0"));
}

#[test]
fn critical_kernel_event_fails_the_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path(), 2);
    config.memory.workers = 1;
    let log = kernel_log(&config);
    append(&log, "INFO: task stale:1 blocked for more than 120 seconds.");

    let mut orchestrator = Orchestrator::new(
        config,
        launcher(&[(WorkerCategory::Memory, &["sleep", "{duration}"])]),
        Arc::new(FakeDeviceControl::new()),
        Arc::new(ManualInterrupt::new()),
    )
    .with_privileged(false)
    .with_log_source(Box::new(FileLogSource::new(log.clone())));

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        append(&log, "INFO: task kworker/u8:3:77 blocked for more than 122 seconds.");
        append(&log, "Call Trace:");
    });

    let report = orchestrator.run().unwrap();
    writer.join().unwrap();

    let monitor = report.monitor.as_ref().unwrap();
    // the backlog line written before start is not attributed to this run
    assert_eq!(monitor.counters.count("hung_task"), 1);
    assert_eq!(monitor.counters.count("blocking"), 1);
    assert_eq!(monitor.counters.count("call_trace"), 1);
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(report.critical_categories, vec!["hung_task".to_string()]);
}
