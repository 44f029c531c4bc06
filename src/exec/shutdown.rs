/// Two-phase worker shutdown: TERM and grace, then KILL and reap.
use crate::config::types::StressError;
use crate::exec::registry::{WorkerFilter, WorkerId, WorkerRegistry, WorkerSummary};
use crate::safety::cleanup::remove_tree;
use log::{error, info, warn};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Upper bound on waiting for SIGKILLed workers to be reaped
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub term_sent: usize,
    /// Still alive when the grace period ran out
    pub survivors: Vec<WorkerId>,
    pub killed: usize,
    /// Not reaped even after SIGKILL (uninterruptible sleep)
    pub unreaped: Vec<WorkerId>,
    pub workers: Vec<WorkerSummary>,
    pub cleanup_warnings: Vec<String>,
    pub elapsed_ms: u64,
}

/// Shut every registered worker down.
///
/// The registry is closed first so nothing can be registered behind the
/// protocol. Never fails; survivors are reported and logged.
pub fn run_shutdown_protocol(registry: &WorkerRegistry, grace: Duration) -> ShutdownReport {
    let started = Instant::now();
    registry.close();

    let mut report = ShutdownReport {
        term_sent: registry.signal_all(Signal::SIGTERM, WorkerFilter::All),
        ..ShutdownReport::default()
    };
    info!(
        "Shutdown: SIGTERM sent to {} worker(s), grace {:?}",
        report.term_sent, grace
    );

    report.survivors = registry.await_all(grace);
    if !report.survivors.is_empty() {
        let timeout = StressError::ShutdownTimeout {
            survivors: report.survivors.clone(),
            waited: grace,
        };
        warn!("{}", timeout);
        report.killed = registry.signal_all(Signal::SIGKILL, WorkerFilter::Ids(&report.survivors));
        report.unreaped = registry.await_all(KILL_REAP_TIMEOUT);
        if !report.unreaped.is_empty() {
            error!(
                "Workers {:?} survived SIGKILL for {:?}",
                report.unreaped, KILL_REAP_TIMEOUT
            );
        }
    }

    for worker in registry.drain_exited() {
        for path in &worker.scratch {
            if let Err(e) = remove_tree(path) {
                warn!("Scratch cleanup for worker {}: {}", worker.id, e);
                report.cleanup_warnings.push(e);
            }
        }
        report.workers.push(worker.summary());
    }

    // unreaped workers keep their handle and their scratch files
    let held = registry.summaries(WorkerFilter::All);
    report.unreaped = held.iter().map(|w| w.id).collect();
    for worker in held {
        report.cleanup_warnings.push(format!(
            "worker {} (pid {}) not confirmed terminated, scratch left in place",
            worker.id, worker.pid
        ));
        report.workers.push(worker);
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        "Shutdown complete in {}ms ({} worker(s), {} force-killed)",
        report.elapsed_ms,
        report.workers.len(),
        report.killed
    );
    report
}
