//! Run core.
//!
//! The orchestrator owns the fault device, the worker registry and the
//! monitor for the lifetime of one run.

pub mod orchestrator;

pub use orchestrator::{Orchestrator, RunReport, RunState, Verdict};
