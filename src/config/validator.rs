// Startup validation for RunConfig.
// Errors abort the run before any resource is acquired; warnings degrade it.

use crate::config::types::{LogSourceKind, RunConfig, StressError, Result};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Fault injection was requested but cannot be honoured
    pub disable_fault_injection: bool,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate config at Setup
///
/// `privileged` reports whether the process may manage loop and dm devices,
/// either directly or by escalating.
pub fn validate_config(config: &RunConfig, privileged: bool) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_timing(config, &mut result);
    validate_loads(config, &mut result);
    validate_fault(config, privileged, &mut result);
    validate_monitor(config, &mut result);

    if !result.is_valid() {
        return Err(StressError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_timing(config: &RunConfig, result: &mut ValidationResult) {
    if config.duration_secs == 0 {
        result.add_error("duration_secs must be greater than zero".to_string());
    }
    if config.grace_period_ms == 0 {
        result.add_warning(
            "grace_period_ms is zero: workers are killed without a chance to flush".to_string(),
        );
    }
}

fn validate_loads(config: &RunConfig, result: &mut ValidationResult) {
    if config.total_workers() == 0 {
        result.add_warning("no workers configured; only the kernel log is observed".to_string());
    }
    if config.memory.workers > 0 && config.memory.bytes_per_worker == 0 {
        result.add_error("memory.bytes_per_worker cannot be zero".to_string());
    }
    if config.io.workers > 0 {
        if config.io.block_size == 0 || config.io.block_size % 512 != 0 {
            result.add_error(format!(
                "io.block_size {} must be a non-zero multiple of 512",
                config.io.block_size
            ));
        }
        if config.io.queue_depth == 0 {
            result.add_error("io.queue_depth cannot be zero".to_string());
        }
        if config.io.target.is_none() && !config.fault.enabled {
            result.add_error(
                "io workers need io.target or an enabled fault device to write to".to_string(),
            );
        }
    }
    for custom in &config.custom {
        if custom.command.is_empty() {
            result.add_error(format!("custom worker '{}' has an empty command", custom.name));
        }
    }
    for (category, argv) in &config.templates {
        if argv.is_empty() {
            result.add_error(format!("template for {} is empty", category));
        }
    }
}

fn validate_fault(config: &RunConfig, privileged: bool, result: &mut ValidationResult) {
    let fault = &config.fault;
    if !fault.enabled {
        return;
    }

    let total_sectors = fault.size_bytes / 512;
    if fault.size_bytes == 0 || fault.size_bytes % 512 != 0 {
        result.add_error(format!(
            "fault.size_bytes {} must be a non-zero multiple of 512",
            fault.size_bytes
        ));
    } else if fault.error_start_sector.saturating_add(fault.error_sectors) > total_sectors {
        result.add_error(format!(
            "fault error segment [{}, +{}) exceeds device of {} sectors",
            fault.error_start_sector, fault.error_sectors, total_sectors
        ));
    }
    if fault.device_name.is_empty() || fault.device_name.contains('/') {
        result.add_error(format!("invalid fault.device_name '{}'", fault.device_name));
    }

    // on a mounted filesystem fio lays out its file wherever the allocator
    // puts it; only a region reaching past the error segment can hit it
    let error_end = fault
        .error_start_sector
        .saturating_add(fault.error_sectors)
        .saturating_mul(512);
    if config.io.workers > 0
        && config.io.target.is_none()
        && fault.mount_point.is_some()
        && config.io.size < error_end
    {
        result.add_warning(format!(
            "io.size {} ends before the fault segment at byte {}; filesystem I/O may never reach it",
            config.io.size, error_end
        ));
    }

    if !privileged {
        result.add_warning(
            "fault injection requested without root privileges or sudo; continuing without it"
                .to_string(),
        );
        result.disable_fault_injection = true;
    }
}

fn validate_monitor(config: &RunConfig, result: &mut ValidationResult) {
    if !config.monitor.enabled {
        return;
    }
    if config.monitor.interval_ms == 0 {
        result.add_error("monitor.interval_ms cannot be zero".to_string());
    }
    if config.monitor.progress_every == 0 {
        result.add_error("monitor.progress_every cannot be zero".to_string());
    }
    if let LogSourceKind::File { path } = &config.monitor.source {
        if !path.exists() {
            result.add_warning(format!(
                "kernel log {} does not exist yet; reads are retried every tick",
                path.display()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::WorkerCategory;

    #[test]
    fn default_config_is_valid_with_warning() {
        let result = validate_config(&RunConfig::default(), false).unwrap();
        assert!(result.is_valid());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn zero_duration_is_rejected() {
        let mut config = RunConfig::default();
        config.duration_secs = 0;
        assert!(matches!(
            validate_config(&config, true),
            Err(StressError::Config(_))
        ));
    }

    #[test]
    fn unprivileged_fault_injection_degrades() {
        let mut config = RunConfig::default();
        config.fault.enabled = true;
        let result = validate_config(&config, false).unwrap();
        assert!(result.disable_fault_injection);

        let result = validate_config(&config, true).unwrap();
        assert!(!result.disable_fault_injection);
    }

    #[test]
    fn io_region_short_of_error_segment_warns_on_filesystem_target() {
        let mut config = RunConfig::default();
        config.fault.enabled = true;
        config.io.workers = 1;
        config.io.size = 256 * 1024 * 1024;
        config.fault.mount_point = Some("/mnt/stressbox".into());
        let result = validate_config(&config, true).unwrap();
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("fault segment at byte 536870912")));

        // the raw device is exercised across its full size
        config.fault.mount_point = None;
        let result = validate_config(&config, true).unwrap();
        assert!(!result.warnings.iter().any(|w| w.contains("fault segment")));
    }

    #[test]
    fn error_segment_must_fit_device() {
        let mut config = RunConfig::default();
        config.fault.enabled = true;
        config.fault.size_bytes = 1024 * 512;
        config.fault.error_start_sector = 1000;
        config.fault.error_sectors = 100;
        assert!(validate_config(&config, true).is_err());
    }

    #[test]
    fn empty_template_is_rejected() {
        let mut config = RunConfig::default();
        config.templates.insert(WorkerCategory::Memory, Vec::new());
        assert!(validate_config(&config, true).is_err());
    }
}
