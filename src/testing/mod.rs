//! Testing infrastructure
//!
//! In-memory stand-ins for host facilities, used by unit and integration tests.

pub mod fake_device;

pub use fake_device::FakeDeviceControl;
