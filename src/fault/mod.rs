//! Fault injection
//!
//! A file-backed loop device wrapped in a device-mapper table whose middle
//! segment fails every I/O.

pub mod backing;
pub mod device;

pub use device::{FaultDevice, VirtualBlockDeviceBuilder};
