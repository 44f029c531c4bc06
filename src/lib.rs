//! stressbox: concurrent storage and memory stress harness
//! Drives load generators in parallel, injects deterministic block-device
//! I/O errors, and correlates the run with kernel log events.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::control`]: Device control surface (losetup, dmsetup, mkfs, mount)
//! - [`kernel::loopdev`]: Free loop slot discovery and binding
//! - [`kernel::devmapper`]: Linear/error/linear table construction
//! - [`kernel::mount`]: Mount table probing and unmount
//! - [`kernel::signal`]: Async-signal-safe interrupt flags
//!
//! ## Fault Injection ([`fault`])
//! - [`fault::backing`]: Zero-filled backing store allocation
//! - [`fault::device`]: Virtual block device with an error segment
//!
//! ## Execution ([`exec`])
//! - [`exec::launcher`]: Command templates for load generators
//! - [`exec::registry`]: Registry of running workers
//! - [`exec::shutdown`]: TERM, grace, KILL, cleanup
//!
//! ## Kernel Log Monitoring ([`monitor`])
//! - [`monitor::classifier`]: Ordered, multi-match rules
//! - [`monitor::counters`]: Per-category counts and detail buffers
//! - [`monitor::source`]: `/dev/kmsg` and text log readers
//! - [`monitor::ticker`]: Real and test-driven sampling cadence
//! - [`monitor::kernel_log`]: Sampler thread and state machine
//!
//! ## Run Core ([`core`])
//! - [`core::orchestrator`]: Setup, run, exactly-once finalize, report
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::cleanup`]: Resource ledger released in reverse order
//!
//! # Design Principles
//!
//! 1. **Reverse-order teardown** - Mount, mapping, loop, backing file
//! 2. **Idempotent cleanup** - Absent resources count as released
//! 3. **Degrade, don't abort** - Fault injection and worker categories fail alone
//! 4. **Owned state** - Counters live on the sampler thread until stop

// Kernel Primitives
pub mod kernel;

// Fault Injection
pub mod fault;

// Execution
pub mod exec;

// Kernel Log Monitoring
pub mod monitor;

// Run Core
pub mod core;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring for the stressbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use core::orchestrator::{Orchestrator, RunReport, RunState};
