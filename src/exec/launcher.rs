/// Load-generator launching.
///
/// The launcher only turns a category and a parameter set into a running
/// process plus the path of its output artifact. Artifacts are never parsed.
use crate::config::types::{Result, StressError, WorkerCategory};
use crate::exec::registry::SpawnedWorker;
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Parameters for one worker launch
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub category: WorkerCategory,
    pub index: u32,
    pub label: String,
    /// Directory for the worker's stdout/stderr log
    pub log_dir: PathBuf,
    /// Placeholder values; `name` and `artifact` are filled in by the launcher
    pub params: BTreeMap<String, String>,
    /// Explicit argv, used instead of the category template
    pub command: Option<Vec<String>>,
    pub scratch: Vec<PathBuf>,
}

impl LaunchRequest {
    pub fn new(category: WorkerCategory, index: u32, log_dir: PathBuf) -> Self {
        Self {
            category,
            index,
            label: format!("{}-{}", category, index),
            log_dir,
            params: BTreeMap::new(),
            command: None,
            scratch: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.label))
    }
}

/// Turns a launch request into a running process
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<SpawnedWorker>;
}

/// argv with `{placeholder}` substitution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn new<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitute every `{name}`. Braces not enclosing an identifier are
    /// kept literally; an identifier with no value is an error.
    pub fn render(&self, params: &BTreeMap<String, String>) -> std::result::Result<Vec<String>, String> {
        if self.argv.is_empty() {
            return Err("empty command template".to_string());
        }
        self.argv.iter().map(|arg| render_arg(arg, params)).collect()
    }
}

fn render_arg(arg: &str, params: &BTreeMap<String, String>) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close)
                if close > 0
                    && after[..close]
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                let key = &after[..close];
                let value = params
                    .get(key)
                    .ok_or_else(|| format!("unknown placeholder {{{}}} in '{}'", key, arg))?;
                out.push_str(value);
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Built-in template for a category
pub fn default_template(category: WorkerCategory) -> Option<CommandTemplate> {
    let argv: &[&str] = match category {
        WorkerCategory::Memory => &[
            "stress-ng",
            "--vm",
            "1",
            "--vm-bytes",
            "{bytes}",
            "--vm-keep",
            "--timeout",
            "{duration}s",
            "--metrics-brief",
        ],
        WorkerCategory::FileChurn => &[
            "fio",
            "--name={name}",
            "--directory={directory}",
            "--rw=randwrite",
            "--nrfiles={files}",
            "--filesize={file_size}",
            "--time_based",
            "--runtime={duration}",
            "--output-format=json",
        ],
        WorkerCategory::Io => &[
            "fio",
            "--name={name}",
            "--filename={target}",
            "--rw=randrw",
            "--bs={block_size}",
            "--iodepth={queue_depth}",
            "--size={size}",
            "--ioengine=psync",
            "--time_based",
            "--runtime={duration}",
            "--continue_on_error=all",
            "--output-format=json",
        ],
        WorkerCategory::Monitor => &["vmstat", "-t", "{interval}"],
        WorkerCategory::Custom => return None,
    };
    Some(CommandTemplate::new(argv.iter().copied()))
}

/// Launcher driven by per-category command templates
#[derive(Clone, Debug)]
pub struct TemplateLauncher {
    templates: BTreeMap<WorkerCategory, CommandTemplate>,
}

impl Default for TemplateLauncher {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

impl TemplateLauncher {
    /// Built-in templates, replaced per category by `overrides`
    pub fn new(overrides: &BTreeMap<WorkerCategory, Vec<String>>) -> Self {
        let mut templates = BTreeMap::new();
        for category in WorkerCategory::ALL {
            if let Some(template) = default_template(category) {
                templates.insert(category, template);
            }
        }
        for (category, argv) in overrides {
            templates.insert(*category, CommandTemplate::new(argv.iter().cloned()));
        }
        Self { templates }
    }

    pub fn template(&self, category: WorkerCategory) -> Option<&CommandTemplate> {
        self.templates.get(&category)
    }

    fn resolve_argv(&self, request: &LaunchRequest) -> std::result::Result<Vec<String>, String> {
        let mut params = request.params.clone();
        params
            .entry("name".to_string())
            .or_insert_with(|| request.label.clone());
        params.insert(
            "artifact".to_string(),
            request.artifact_path().display().to_string(),
        );
        params.insert("index".to_string(), request.index.to_string());

        match &request.command {
            Some(argv) => CommandTemplate::new(argv.iter().cloned()).render(&params),
            None => self
                .templates
                .get(&request.category)
                .ok_or_else(|| format!("no command template for {}", request.category))?
                .render(&params),
        }
    }
}

impl WorkerLauncher for TemplateLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<SpawnedWorker> {
        let spawn_error = |reason: String| StressError::WorkerSpawn {
            category: request.category,
            reason,
        };

        let argv = self.resolve_argv(request).map_err(spawn_error)?;
        fs::create_dir_all(&request.log_dir)
            .map_err(|e| spawn_error(format!("log dir {}: {}", request.log_dir.display(), e)))?;

        let artifact = request.artifact_path();
        let stdout = File::create(&artifact)
            .map_err(|e| spawn_error(format!("create {}: {}", artifact.display(), e)))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| spawn_error(format!("dup {}: {}", artifact.display(), e)))?;

        debug!("Launching {}: {}", request.label, argv.join(" "));
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| spawn_error(format!("spawn {}: {}", argv[0], e)))?;

        info!(
            "Started {} worker {} (pid {})",
            request.category,
            request.label,
            child.id()
        );
        Ok(SpawnedWorker {
            child,
            label: request.label.clone(),
            artifact: Some(artifact),
            scratch: request.scratch.clone(),
        })
    }
}
