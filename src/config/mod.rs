//! Configuration
//!
//! - [`types`]: run configuration snapshot, error taxonomy, worker categories
//! - [`validator`]: startup validation with degrade-or-abort decisions

pub mod types;
pub mod validator;
