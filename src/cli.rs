use crate::config::types::{parse_size, LogSourceKind, RunConfig};
use crate::config::validator::validate_config;
use crate::core::orchestrator::{Orchestrator, Verdict};
use crate::exec::launcher::TemplateLauncher;
use crate::kernel::control::{mapped_device_path, ControlError, DeviceControl, SystemDeviceControl};
use crate::kernel::signal::SignalHandler;
use crate::monitor::classifier::default_rules;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Exit status when critical kernel events were observed
const EXIT_CRITICAL_EVENTS: i32 = 2;

#[derive(Parser)]
#[command(author, version, about = "Concurrent storage and memory stress harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stress session
    Run(RunArgs),
    /// Validate a configuration without acquiring anything
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// List the kernel log rules
    Rules,
    /// Remove a fault device left behind by a crashed run
    Cleanup {
        #[arg(long, default_value = "stressbox-faulty")]
        device_name: String,
        /// Mount point to unmount first
        #[arg(long)]
        mount_point: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// JSON configuration file; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run duration in seconds
    #[arg(long)]
    duration: Option<u64>,
    /// SIGTERM to SIGKILL grace period in milliseconds
    #[arg(long)]
    grace_ms: Option<u64>,
    #[arg(long)]
    memory_workers: Option<u32>,
    /// Bytes per memory worker (k/m/g suffixes)
    #[arg(long, value_parser = parse_size_arg)]
    memory_size: Option<u64>,
    #[arg(long)]
    churn_workers: Option<u32>,
    #[arg(long)]
    churn_dir: Option<PathBuf>,
    #[arg(long)]
    io_workers: Option<u32>,
    /// File or device for io workers when no fault device is active
    #[arg(long)]
    io_target: Option<PathBuf>,
    /// Build a loop/device-mapper device with an error segment
    #[arg(long)]
    fault: bool,
    /// Backing store size (k/m/g suffixes)
    #[arg(long, value_parser = parse_size_arg)]
    fault_size: Option<u64>,
    #[arg(long)]
    fault_mount: Option<PathBuf>,
    /// Read this text log instead of /dev/kmsg
    #[arg(long)]
    kernel_log: Option<PathBuf>,
    #[arg(long)]
    no_monitor: bool,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

fn parse_size_arg(raw: &str) -> std::result::Result<u64, String> {
    parse_size(raw).map_err(|e| e.to_string())
}

impl RunArgs {
    fn into_config(self) -> Result<(RunConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RunConfig::default(),
        };

        if let Some(v) = self.duration {
            config.duration_secs = v;
        }
        if let Some(v) = self.grace_ms {
            config.grace_period_ms = v;
        }
        if let Some(v) = self.memory_workers {
            config.memory.workers = v;
        }
        if let Some(v) = self.memory_size {
            config.memory.bytes_per_worker = v;
        }
        if let Some(v) = self.churn_workers {
            config.file_churn.workers = v;
        }
        if self.churn_dir.is_some() {
            config.file_churn.target_dir = self.churn_dir;
        }
        if let Some(v) = self.io_workers {
            config.io.workers = v;
        }
        if self.io_target.is_some() {
            config.io.target = self.io_target;
        }
        if self.fault {
            config.fault.enabled = true;
        }
        if let Some(v) = self.fault_size {
            config.fault.size_bytes = v;
        }
        if self.fault_mount.is_some() {
            config.fault.mount_point = self.fault_mount;
        }
        if let Some(path) = self.kernel_log {
            config.monitor.source = LogSourceKind::File { path };
        }
        if self.no_monitor {
            config.monitor.enabled = false;
        }
        if let Some(v) = self.output_dir {
            config.output_dir = v;
        }
        Ok((config, self.json))
    }
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_session(args),
        Commands::Validate { config } => {
            let config = RunConfig::from_json_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let privileged = nix::unistd::geteuid().is_root();
            let result = validate_config(&config, privileged)?;
            for warning in &result.warnings {
                eprintln!("warning: {}", warning);
            }
            println!("configuration is valid ({} workers)", config.total_workers());
            Ok(())
        }
        Commands::Rules => {
            let rules = default_rules()?;
            for rule in rules.rules() {
                println!(
                    "{:<20} {}",
                    rule.label,
                    if rule.critical { "critical" } else { "" }
                );
            }
            Ok(())
        }
        Commands::Cleanup {
            device_name,
            mount_point,
        } => cleanup_leftovers(&device_name, mount_point),
    }
}

fn run_session(args: RunArgs) -> Result<()> {
    // before any thread exists
    let signals = SignalHandler::init().map_err(anyhow::Error::msg)?;
    let (config, json) = args.into_config()?;

    let launcher = Arc::new(TemplateLauncher::new(&config.templates));
    let control = Arc::new(SystemDeviceControl::new());
    let mut orchestrator = Orchestrator::new(config, launcher, control, Arc::new(signals));
    let report = orchestrator.run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        eprintln!(
            "run {} finished: {:?}, {} worker(s), summary in {}",
            report.run_id,
            report.verdict,
            report.workers.len(),
            report.run_dir.display()
        );
        if !report.critical_categories.is_empty() {
            eprintln!("critical events: {}", report.critical_categories.join(", "));
        }
    }

    if report.verdict == Verdict::Fail {
        std::process::exit(EXIT_CRITICAL_EVENTS);
    }
    Ok(())
}

fn cleanup_leftovers(device_name: &str, mount_point: Option<PathBuf>) -> Result<()> {
    let control = SystemDeviceControl::new();
    let ignore_absent = |r: std::result::Result<(), ControlError>| match r {
        Ok(()) | Err(ControlError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    };

    if let Some(mp) = mount_point {
        ignore_absent(control.unmount(&mp)).context("unmount")?;
    }

    // loop devices referenced by the mapping are found before it is removed
    let backing_loops = loops_under_mapping(device_name);
    ignore_absent(control.remove_mapping(device_name)).context("remove mapping")?;
    for device in backing_loops {
        ignore_absent(control.detach_loop(&device))
            .with_context(|| format!("detach {}", device.display()))?;
    }
    eprintln!("{} cleaned up", mapped_device_path(device_name).display());
    Ok(())
}

/// Loop devices sitting under a dm device, via sysfs `slaves`
fn loops_under_mapping(device_name: &str) -> Vec<PathBuf> {
    let mapped = mapped_device_path(device_name);
    let Ok(target) = std::fs::canonicalize(&mapped) else {
        return Vec::new();
    };
    let Some(dm) = target.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let slaves = PathBuf::from("/sys/block").join(dm).join("slaves");
    std::fs::read_dir(slaves)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .filter(|name| name.starts_with("loop"))
                .map(|name| PathBuf::from("/dev").join(name))
                .collect()
        })
        .unwrap_or_default()
}
