//! Kernel log monitoring
//!
//! classifier -> counters -> kernel_log, fed by a source and a ticker.

pub mod classifier;
pub mod counters;
pub mod kernel_log;
pub mod source;
pub mod ticker;

pub use classifier::{classify, default_rules, EventMatch, EventRule, Matcher, RuleSet};
pub use counters::{CategoryStats, EventCounters, EventRecord};
pub use kernel_log::{KernelLogMonitor, MonitorCore, MonitorReport, MonitorState};
pub use source::{FileLogSource, KmsgSource, LogSource};
pub use ticker::{IntervalTicker, ManualTicker, TickDriver, Ticker};
