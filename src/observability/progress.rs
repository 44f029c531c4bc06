// Live progress reporting
//
// The monitor emits a snapshot every N ticks. Sinks decide where it goes:
// the log for interactive runs, a channel for tests and embedding callers.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Point-in-time view of the event counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub tick: u64,
    pub at: DateTime<Utc>,
    pub elapsed: Duration,
    pub lines_seen: u64,
    pub counts: BTreeMap<String, u64>,
}

impl ProgressSnapshot {
    pub fn count(&self, label: &str) -> u64 {
        self.counts.get(label).copied().unwrap_or(0)
    }

    /// `label=count` pairs for non-zero categories
    pub fn summary_line(&self) -> String {
        let nonzero: Vec<String> = self
            .counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(label, n)| format!("{}={}", label, n))
            .collect();
        if nonzero.is_empty() {
            "no events".to_string()
        } else {
            nonzero.join(" ")
        }
    }
}

pub trait ProgressSink: Send {
    fn emit(&mut self, snapshot: &ProgressSnapshot);
}

/// Writes snapshots through `log::info!`
#[derive(Debug, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn emit(&mut self, snapshot: &ProgressSnapshot) {
        info!(
            "[{:>5}s] {} lines, {}",
            snapshot.elapsed.as_secs(),
            snapshot.lines_seen,
            snapshot.summary_line()
        );
    }
}

/// Forwards snapshots to a channel; a gone receiver is ignored
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: Sender<ProgressSnapshot>,
}

impl ChannelProgressSink {
    pub fn new(tx: Sender<ProgressSnapshot>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&mut self, snapshot: &ProgressSnapshot) {
        let _ = self.tx.send(snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(counts: &[(&str, u64)]) -> ProgressSnapshot {
        ProgressSnapshot {
            tick: 30,
            at: Utc::now(),
            elapsed: Duration::from_secs(30),
            lines_seen: 12,
            counts: counts.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn summary_skips_zero_categories() {
        let s = snapshot(&[("hung_task", 0), ("oom", 2), ("io_error", 1)]);
        assert_eq!(s.summary_line(), "io_error=1 oom=2");
        assert_eq!(snapshot(&[("oom", 0)]).summary_line(), "no events");
        assert_eq!(s.count("missing"), 0);
    }

    #[test]
    fn channel_sink_forwards_and_tolerates_closed_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sink = ChannelProgressSink::new(tx);
        sink.emit(&snapshot(&[("oom", 1)]));
        assert_eq!(rx.recv().unwrap().count("oom"), 1);
        drop(rx);
        sink.emit(&snapshot(&[]));
    }
}
