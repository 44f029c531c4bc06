//! Kernel log monitor.
//!
//! `Idle -> Sampling -> Stopped`. While sampling, a dedicated thread owns the
//! source and the counters; [`KernelLogMonitor::stop`] takes them back by
//! joining that thread, which is what freezes the counters.

use crate::config::types::Result;
use crate::monitor::classifier::RuleSet;
use crate::monitor::counters::EventCounters;
use crate::monitor::source::LogSource;
use crate::monitor::ticker::Ticker;
use crate::observability::progress::{ProgressSink, ProgressSnapshot};
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Idle,
    Sampling,
    Stopped,
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub lines: usize,
    pub events: usize,
    pub read_failed: bool,
    pub progress_emitted: bool,
}

/// Final state handed over on stop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorReport {
    pub source: String,
    pub ticks: u64,
    pub read_failures: u64,
    pub counters: EventCounters,
}

/// Single-threaded sampling logic, shared by the monitor thread and tests
pub struct MonitorCore {
    source: Box<dyn LogSource>,
    rules: Arc<RuleSet>,
    sink: Box<dyn ProgressSink>,
    counters: EventCounters,
    /// Kernel names of the injected fault device
    expected_devices: Vec<String>,
    progress_every: u64,
    ticks: u64,
    read_failures: u64,
    started: Instant,
}

impl MonitorCore {
    pub fn new(
        source: Box<dyn LogSource>,
        rules: Arc<RuleSet>,
        sink: Box<dyn ProgressSink>,
        progress_every: u64,
    ) -> Self {
        let counters = EventCounters::with_categories(rules.labels());
        Self {
            source,
            rules,
            sink,
            counters,
            expected_devices: Vec::new(),
            progress_every,
            ticks: 0,
            read_failures: 0,
            started: Instant::now(),
        }
    }

    /// Critical events naming one of `devices` are counted as expected
    pub fn with_expected_devices(mut self, devices: Vec<String>) -> Self {
        self.expected_devices = devices;
        self
    }

    fn is_expected(&self, detail: Option<&str>) -> bool {
        detail.is_some_and(|d| self.expected_devices.iter().any(|dev| dev == d))
    }

    /// Take the baseline. A failure is not fatal: reads keep retrying.
    pub fn begin(&mut self) {
        self.started = Instant::now();
        match self.source.start() {
            Ok(()) => info!("Monitoring {}", self.source.describe()),
            Err(e) => warn!("Kernel log baseline not taken yet: {}", e),
        }
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        self.ticks += 1;
        let mut outcome = TickOutcome::default();

        match self.source.read_new() {
            Ok(lines) => {
                outcome.lines = lines.len();
                for line in &lines {
                    self.counters.note_line();
                    for event in self.rules.classify(line) {
                        let limit = self
                            .rules
                            .get(event.label)
                            .and_then(|rule| rule.detail_limit);
                        outcome.events += 1;
                        if event.critical && self.is_expected(event.detail.as_deref()) {
                            self.counters.record_expected(now, line, &event, limit);
                            debug!("kernel: [{}] expected: {}", event.label, line);
                            continue;
                        }
                        self.counters.record(now, line, &event, limit);
                        if event.critical {
                            warn!("kernel: [{}] {}", event.label, line);
                        } else {
                            debug!("kernel: [{}] {}", event.label, line);
                        }
                    }
                }
            }
            Err(e) => {
                self.read_failures += 1;
                outcome.read_failed = true;
                warn!("Skipping monitor tick {}: {}", self.ticks, e);
            }
        }

        if self.progress_every > 0 && self.ticks % self.progress_every == 0 {
            self.sink.emit(&self.snapshot(now));
            outcome.progress_emitted = true;
        }
        outcome
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ProgressSnapshot {
        ProgressSnapshot {
            tick: self.ticks,
            at: now,
            elapsed: self.started.elapsed(),
            lines_seen: self.counters.lines_seen(),
            counts: self.counters.snapshot(),
        }
    }

    pub fn counters(&self) -> &EventCounters {
        &self.counters
    }

    fn into_report(self) -> MonitorReport {
        MonitorReport {
            source: self.source.describe(),
            ticks: self.ticks,
            read_failures: self.read_failures,
            counters: self.counters,
        }
    }
}

type Sampler = (Box<MonitorCore>, Box<dyn Ticker>);
type SamplerTask = Box<dyn FnOnce() -> Option<MonitorCore> + Send>;

fn take_sampler(slot: &Mutex<Option<Sampler>>) -> Option<Sampler> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

enum Phase {
    Idle {
        core: Box<MonitorCore>,
        ticker: Box<dyn Ticker>,
    },
    Sampling {
        handle: JoinHandle<Option<MonitorCore>>,
        shutdown: Sender<()>,
    },
    Stopped(MonitorReport),
    /// Transient placeholder while switching phases
    Switching,
}

pub struct KernelLogMonitor {
    phase: Phase,
}

impl KernelLogMonitor {
    pub fn new(
        source: Box<dyn LogSource>,
        rules: Arc<RuleSet>,
        sink: Box<dyn ProgressSink>,
        ticker: Box<dyn Ticker>,
        progress_every: u64,
    ) -> Self {
        Self {
            phase: Phase::Idle {
                core: Box::new(MonitorCore::new(source, rules, sink, progress_every)),
                ticker,
            },
        }
    }

    pub fn state(&self) -> MonitorState {
        match self.phase {
            Phase::Idle { .. } => MonitorState::Idle,
            Phase::Sampling { .. } => MonitorState::Sampling,
            Phase::Stopped(_) | Phase::Switching => MonitorState::Stopped,
        }
    }

    /// Attribute critical events on these devices to fault injection.
    /// Only takes effect before `start`.
    pub fn with_expected_devices(mut self, devices: Vec<String>) -> Self {
        if let Phase::Idle { core, .. } = &mut self.phase {
            core.expected_devices = devices;
        }
        self
    }

    /// Record the baseline and start the sampler thread.
    /// Only valid from `Idle`; later calls are ignored. If the thread cannot
    /// be spawned the monitor stays `Idle` and may be started again.
    pub fn start(&mut self) -> Result<()> {
        self.start_with(|task| {
            thread::Builder::new()
                .name("kernel-log-monitor".to_string())
                .spawn(task)
        })
    }

    fn start_with<F>(&mut self, spawn: F) -> Result<()>
    where
        F: FnOnce(SamplerTask) -> io::Result<JoinHandle<Option<MonitorCore>>>,
    {
        let (mut core, ticker) = match std::mem::replace(&mut self.phase, Phase::Switching) {
            Phase::Idle { core, ticker } => (core, ticker),
            other => {
                self.phase = other;
                warn!("Kernel log monitor already started");
                return Ok(());
            }
        };

        core.begin();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        // the sampler parks here until the thread runs, so a failed spawn
        // hands it back instead of dropping it with the closure
        let slot = Arc::new(Mutex::new(Some((core, ticker))));
        let task_slot = Arc::clone(&slot);
        let task: SamplerTask = Box::new(move || {
            let (mut core, mut ticker) = take_sampler(&task_slot)?;
            while ticker.wait_tick(&shutdown_rx) {
                core.tick(ticker.now());
            }
            // pick up lines written right before stop
            core.tick(ticker.now());
            Some(*core)
        });

        match spawn(task) {
            Ok(handle) => {
                self.phase = Phase::Sampling {
                    handle,
                    shutdown: shutdown_tx,
                };
                Ok(())
            }
            Err(e) => {
                self.phase = match take_sampler(&slot) {
                    Some((core, ticker)) => Phase::Idle { core, ticker },
                    None => Phase::Stopped(MonitorReport::default()),
                };
                warn!("Kernel log sampler thread not started: {}", e);
                Err(e.into())
            }
        }
    }

    /// Stop sampling and freeze the counters. Idempotent: later calls return
    /// the same report. Stopping an idle monitor yields empty counters.
    pub fn stop(&mut self) -> MonitorReport {
        let report = match std::mem::replace(&mut self.phase, Phase::Switching) {
            Phase::Idle { core, .. } => core.into_report(),
            Phase::Sampling { handle, shutdown } => {
                let _ = shutdown.send(());
                let started = Instant::now();
                match handle.join() {
                    Ok(Some(core)) => {
                        debug!("Monitor stopped after {:?}", started.elapsed());
                        core.into_report()
                    }
                    Ok(None) => {
                        error!("Kernel log sampler ran without its state");
                        MonitorReport::default()
                    }
                    Err(e) => {
                        error!("Kernel log monitor thread panicked: {:?}", e);
                        MonitorReport::default()
                    }
                }
            }
            Phase::Stopped(report) => report,
            Phase::Switching => MonitorReport::default(),
        };

        info!(
            "Kernel log monitor stopped: {} ticks, {} events ({} expected), {} read failure(s)",
            report.ticks,
            report.counters.total_events(),
            report.counters.expected_events(),
            report.read_failures
        );
        self.phase = Phase::Stopped(report.clone());
        report
    }
}

impl Drop for KernelLogMonitor {
    fn drop(&mut self) {
        if let Phase::Sampling { shutdown, .. } = &self.phase {
            let _ = shutdown.send(());
        }
    }
}

/// Interval used when none is configured
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
