//! Worker execution
//!
//! Launching load generators, tracking them, and shutting them down.

pub mod launcher;
pub mod registry;
pub mod shutdown;

pub use launcher::{CommandTemplate, LaunchRequest, TemplateLauncher, WorkerLauncher};
pub use registry::{SpawnedWorker, WorkerFilter, WorkerId, WorkerRegistry, WorkerSummary};
pub use shutdown::{run_shutdown_protocol, ShutdownReport};
