/// Registry of running background workers.
///
/// Single source of truth for what is running. Workers are spawned as
/// process-group leaders, so signals go to the whole group; if the group is
/// already gone the pid itself is signalled.
use crate::config::types::{Result, StressError, WorkerCategory};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

pub type WorkerId = u64;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const DROP_REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// A freshly spawned process, not yet registered
#[derive(Debug)]
pub struct SpawnedWorker {
    pub child: Child,
    pub label: String,
    /// Where the worker writes its result or log
    pub artifact: Option<PathBuf>,
    /// Files or directories the worker creates, deleted at shutdown
    pub scratch: Vec<PathBuf>,
}

impl SpawnedWorker {
    pub fn new(child: Child, label: impl Into<String>) -> Self {
        Self {
            child,
            label: label.into(),
            artifact: None,
            scratch: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Worker {
    pub id: WorkerId,
    pub category: WorkerCategory,
    pub label: String,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub artifact: Option<PathBuf>,
    pub scratch: Vec<PathBuf>,
    child: Child,
    exit: Option<ExitStatus>,
    kill_sent: bool,
}

impl Worker {
    /// Non-blocking reap; true while the process is still running
    fn poll(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Worker {} ({}) exited: {}", self.id, self.label, status);
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("try_wait on worker {} failed: {}", self.id, e);
                false
            }
        }
    }

    fn deliver(&mut self, signal: Signal) -> bool {
        match killpg(Pid::from_raw(self.pid), signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) | Err(Errno::EPERM) => match kill(Pid::from_raw(self.pid), signal) {
                Ok(()) => true,
                Err(Errno::ESRCH) => false,
                Err(e) => {
                    warn!("{} to worker {} failed: {}", signal, self.id, e);
                    false
                }
            },
            Err(e) => {
                warn!("{} to group of worker {} failed: {}", signal, self.id, e);
                false
            }
        }
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            id: self.id,
            category: self.category,
            label: self.label.clone(),
            pid: self.pid,
            started_at: self.started_at,
            exit_code: self.exit.and_then(|s| s.code()),
            signal: self.exit.and_then(|s| s.signal()),
            forced_kill: self.kill_sent,
            artifact: self.artifact.clone(),
        }
    }
}

/// Final record of a worker, kept for the run report
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub category: WorkerCategory,
    pub label: String,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub forced_kill: bool,
    pub artifact: Option<PathBuf>,
}

/// Which workers a bulk operation applies to
#[derive(Clone, Copy, Debug)]
pub enum WorkerFilter<'a> {
    All,
    Category(WorkerCategory),
    Ids(&'a [WorkerId]),
}

impl WorkerFilter<'_> {
    fn admits(&self, worker: &Worker) -> bool {
        match self {
            WorkerFilter::All => true,
            WorkerFilter::Category(c) => worker.category == *c,
            WorkerFilter::Ids(ids) => ids.contains(&worker.id),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: WorkerId,
    workers: BTreeMap<WorkerId, Worker>,
    closed: bool,
}

impl RegistryInner {
    fn insert(&mut self, category: WorkerCategory, spawned: SpawnedWorker) -> WorkerId {
        self.next_id += 1;
        let id = self.next_id;
        let pid = spawned.child.id() as i32;
        debug!("Registered worker {} ({}, pid {})", id, spawned.label, pid);
        self.workers.insert(
            id,
            Worker {
                id,
                category,
                label: spawned.label,
                pid,
                started_at: Utc::now(),
                artifact: spawned.artifact,
                scratch: spawned.scratch,
                child: spawned.child,
                exit: None,
                kill_sent: false,
            },
        );
        id
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    inner: Mutex<RegistryInner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a started worker. After `close()` the process is killed
    /// immediately and `RegistryClosed` is returned.
    pub fn register(&self, category: WorkerCategory, spawned: SpawnedWorker) -> Result<WorkerId> {
        let mut inner = self.lock();
        if inner.closed {
            let mut child = spawned.child;
            warn!("Registry closed, killing late worker {}", spawned.label);
            let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
            let _ = child.kill();
            let _ = child.wait();
            return Err(StressError::RegistryClosed);
        }
        Ok(inner.insert(category, spawned))
    }

    /// Spawn and register under one lock, so a concurrent shutdown either
    /// sees the worker or prevents the spawn.
    pub fn spawn_registered<F>(&self, category: WorkerCategory, spawn: F) -> Result<WorkerId>
    where
        F: FnOnce() -> Result<SpawnedWorker>,
    {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StressError::RegistryClosed);
        }
        let spawned = spawn()?;
        Ok(inner.insert(category, spawned))
    }

    /// Refuse further registrations
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_alive(&self, id: WorkerId) -> bool {
        self.lock()
            .workers
            .get_mut(&id)
            .map(Worker::poll)
            .unwrap_or(false)
    }

    /// Ids of workers still running
    pub fn live_ids(&self) -> Vec<WorkerId> {
        self.lock()
            .workers
            .values_mut()
            .filter_map(|w| if w.poll() { Some(w.id) } else { None })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().workers.is_empty()
    }

    /// Deliver `signal` to every matching live worker.
    /// Returns how many were signalled; dead workers are skipped.
    pub fn signal_all(&self, signal: Signal, filter: WorkerFilter<'_>) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;
        for worker in inner.workers.values_mut() {
            if !filter.admits(worker) || !worker.poll() {
                continue;
            }
            if worker.deliver(signal) {
                if signal == Signal::SIGKILL {
                    worker.kill_sent = true;
                }
                delivered += 1;
            }
        }
        debug!("{} delivered to {} worker(s)", signal, delivered);
        delivered
    }

    /// Wait until every worker has exited or `timeout` elapses.
    /// Returns the ids still alive at the deadline.
    pub fn await_all(&self, timeout: Duration) -> Vec<WorkerId> {
        let deadline = Instant::now() + timeout;
        loop {
            let alive = self.live_ids();
            if alive.is_empty() {
                return alive;
            }
            let now = Instant::now();
            if now >= deadline {
                return alive;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Remove workers whose exit has been reaped. Workers still running
    /// stay registered so their handles outlive any resource they may hold.
    pub fn drain_exited(&self) -> Vec<Worker> {
        let mut inner = self.lock();
        let exited: Vec<WorkerId> = inner
            .workers
            .values_mut()
            .filter_map(|w| if w.poll() { None } else { Some(w.id) })
            .collect();
        exited
            .into_iter()
            .filter_map(|id| inner.workers.remove(&id))
            .collect()
    }

    /// Summaries of registered workers matching `filter`
    pub fn summaries(&self, filter: WorkerFilter<'_>) -> Vec<WorkerSummary> {
        self.lock()
            .workers
            .values()
            .filter(|w| filter.admits(w))
            .map(Worker::summary)
            .collect()
    }
}

impl Drop for WorkerRegistry {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut pending: Vec<&mut Worker> = inner
            .workers
            .values_mut()
            .filter_map(|w| if w.poll() { Some(w) } else { None })
            .collect();
        for worker in pending.iter_mut() {
            warn!("Killing unreleased worker {} on drop", worker.id);
            worker.deliver(Signal::SIGKILL);
        }
        // bounded: a process in uninterruptible sleep never exits
        let deadline = Instant::now() + DROP_REAP_TIMEOUT;
        while !pending.is_empty() && Instant::now() < deadline {
            pending.retain_mut(|w| w.poll());
            if !pending.is_empty() {
                thread::sleep(POLL_INTERVAL);
            }
        }
        for worker in pending {
            warn!(
                "Worker {} (pid {}) still running after SIGKILL, abandoning handle",
                worker.id, worker.pid
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    fn spawn(args: &[&str]) -> SpawnedWorker {
        let child = Command::new(args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        SpawnedWorker::new(child, args.join(" "))
    }

    #[test]
    fn register_assigns_increasing_ids() {
        let registry = WorkerRegistry::new();
        let a = registry
            .register(WorkerCategory::Memory, spawn(&["sleep", "5"]))
            .unwrap();
        let b = registry
            .register(WorkerCategory::Io, spawn(&["sleep", "5"]))
            .unwrap();
        assert!(b > a);
        assert!(registry.is_alive(a));
        assert_eq!(registry.signal_all(Signal::SIGKILL, WorkerFilter::All), 2);
        assert!(registry.await_all(Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn unknown_and_dead_workers_are_skipped() {
        let registry = WorkerRegistry::new();
        let id = registry
            .register(WorkerCategory::Custom, spawn(&["true"]))
            .unwrap();
        assert!(registry.await_all(Duration::from_secs(2)).is_empty());
        assert!(!registry.is_alive(id));
        assert!(!registry.is_alive(9999));
        assert_eq!(registry.signal_all(Signal::SIGTERM, WorkerFilter::All), 0);
    }

    #[test]
    fn category_filter_limits_delivery() {
        let registry = WorkerRegistry::new();
        let mem = registry
            .register(WorkerCategory::Memory, spawn(&["sleep", "5"]))
            .unwrap();
        let io = registry
            .register(WorkerCategory::Io, spawn(&["sleep", "5"]))
            .unwrap();

        registry.signal_all(Signal::SIGTERM, WorkerFilter::Category(WorkerCategory::Memory));
        let survivors = registry.await_all(Duration::from_secs(2));
        assert_eq!(survivors, vec![io]);
        assert!(!registry.is_alive(mem));

        registry.signal_all(Signal::SIGKILL, WorkerFilter::Ids(&survivors));
        assert!(registry.await_all(Duration::from_secs(2)).is_empty());
        let summaries: Vec<_> = registry.drain_exited().iter().map(Worker::summary).collect();
        assert!(summaries.iter().any(|s| s.id == io && s.forced_kill));
        assert!(summaries
            .iter()
            .any(|s| s.id == mem && s.signal == Some(libc::SIGTERM)));
    }

    #[test]
    fn closed_registry_refuses_spawn() {
        let registry = WorkerRegistry::new();
        registry.close();
        let mut spawned = false;
        let result = registry.spawn_registered(WorkerCategory::Memory, || {
            spawned = true;
            Ok(spawn(&["sleep", "5"]))
        });
        assert!(matches!(result, Err(StressError::RegistryClosed)));
        assert!(!spawned);

        let late = spawn(&["sleep", "5"]);
        let pid = late.child.id() as i32;
        assert!(matches!(
            registry.register(WorkerCategory::Memory, late),
            Err(StressError::RegistryClosed)
        ));
        assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_keeps_running_workers_registered() {
        let registry = WorkerRegistry::new();
        let done = registry
            .register(WorkerCategory::Custom, spawn(&["true"]))
            .unwrap();
        let running = registry
            .register(WorkerCategory::Io, spawn(&["sleep", "30"]))
            .unwrap();
        assert_eq!(registry.await_all(Duration::from_millis(300)), vec![running]);

        let drained: Vec<_> = registry.drain_exited().iter().map(|w| w.id).collect();
        assert_eq!(drained, vec![done]);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_alive(running));
        let held = registry.summaries(WorkerFilter::Ids(&[running]));
        assert_eq!(held.len(), 1);
        assert_eq!(kill(Pid::from_raw(held[0].pid), None), Ok(()));

        registry.signal_all(Signal::SIGKILL, WorkerFilter::All);
        assert!(registry.await_all(Duration::from_secs(2)).is_empty());
        assert_eq!(registry.drain_exited().len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn await_all_reports_survivors_at_deadline() {
        let registry = WorkerRegistry::new();
        let id = registry
            .register(WorkerCategory::Memory, spawn(&["sleep", "5"]))
            .unwrap();
        let started = Instant::now();
        assert_eq!(registry.await_all(Duration::from_millis(100)), vec![id]);
        assert!(started.elapsed() < Duration::from_secs(1));
        registry.signal_all(Signal::SIGKILL, WorkerFilter::All);
        assert!(registry.await_all(Duration::from_secs(2)).is_empty());
    }
}
