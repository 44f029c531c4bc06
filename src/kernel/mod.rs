//! Thin wrappers around Linux kernel primitives.
//!
//! Dependency direction: signal -> mount -> loopdev -> devmapper -> control

pub mod control;
pub mod devmapper;
pub mod loopdev;
pub mod mount;
pub mod signal;
