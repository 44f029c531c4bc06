//! Observability
//!
//! Live progress snapshots from the kernel log monitor.

pub mod progress;

pub use progress::{ChannelProgressSink, LogProgressSink, ProgressSink, ProgressSnapshot};
