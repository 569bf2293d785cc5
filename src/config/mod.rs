// Config module - Application descriptors and daemon settings

mod memory;
mod settings;

pub use memory::parse_memory;
pub use settings::{DaemonSettings, SupervisorConfig};

use crate::error::{Result, ShepherdError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Signals accepted for `kill_signal`
pub const VALID_SIGNALS: [&str; 7] = [
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

/// Upper bound on instances per application
const MAX_INSTANCES: usize = 100;

// Default value functions
fn default_autorestart() -> bool {
    true
}

fn default_kill_signal() -> String {
    "SIGTERM".to_string()
}

fn default_kill_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_restart_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_restart_delay() -> Duration {
    Duration::from_millis(15_000)
}

fn default_max_restarts() -> usize {
    16
}

fn default_min_uptime() -> Duration {
    Duration::from_millis(30_000)
}

fn default_stop_exit_codes() -> Vec<i32> {
    vec![0]
}

fn default_ignore_watch() -> Vec<String> {
    vec!["node_modules".to_string(), ".git".to_string()]
}

/// How instances of an application are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Fork,
    Cluster,
}

impl ExecMode {
    fn parse(app: &str, value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fork" | "fork_mode" => Ok(ExecMode::Fork),
            "cluster" | "cluster_mode" => Ok(ExecMode::Cluster),
            other => Err(ShepherdError::Config(format!(
                "Application '{}': invalid exec_mode '{}', expected 'fork' or 'cluster'",
                app, other
            ))),
        }
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Fork => write!(f, "fork"),
            ExecMode::Cluster => write!(f, "cluster"),
        }
    }
}

/// The three sinks an application's output is routed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPaths {
    pub out: PathBuf,
    pub err: PathBuf,
    pub combined: PathBuf,
}

impl LogPaths {
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        [self.out.as_path(), self.err.as_path(), self.combined.as_path()].into_iter()
    }
}

/// Validated, immutable description of one supervised application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    /// Unique application name
    pub name: String,
    /// Entry script or executable
    pub script: PathBuf,
    /// Interpreter used to run the script, if any
    pub interpreter: Option<PathBuf>,
    /// Arguments passed after the script
    pub args: Vec<String>,
    /// Working directory of every instance
    pub cwd: PathBuf,
    /// Environment overlay; wins over the supervisor's own environment
    pub env: HashMap<String, String>,
    pub logs: LogPaths,
    /// Prefix combined log lines with a timestamp
    pub time: bool,
    pub autorestart: bool,
    pub watch: bool,
    pub ignore_watch: Vec<String>,
    /// Resident memory ceiling in bytes
    pub max_memory_restart: Option<u64>,
    pub exec_mode: ExecMode,
    pub instances: usize,
    pub kill_signal: String,
    /// Grace period between the kill signal and SIGKILL
    pub kill_timeout: Duration,
    /// First backoff delay after a crash
    pub restart_delay: Duration,
    /// Cap for the exponential backoff
    pub max_restart_delay: Duration,
    /// Consecutive crash-restarts allowed before giving up
    pub max_restarts: usize,
    /// Uptime after which the process counts as healthy
    pub min_uptime: Duration,
    /// Exit codes that mean "done" rather than "crashed"
    pub stop_exit_codes: Vec<i32>,
}

impl ApplicationSpec {
    pub fn is_clustered(&self) -> bool {
        self.exec_mode == ExecMode::Cluster
    }
}

/// `args` given either as a list or a single command-line string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgList {
    List(Vec<String>),
    Line(String),
}

impl ArgList {
    fn into_vec(self) -> Vec<String> {
        match self {
            ArgList::List(list) => list,
            ArgList::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// Environment values; scalars are passed through verbatim as strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for EnvValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvValue::Text(s) => write!(f, "{}", s),
            EnvValue::Integer(i) => write!(f, "{}", i),
            EnvValue::Float(x) => write!(f, "{}", x),
            EnvValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// `max_memory_restart` as a byte count or a suffixed string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryLimit {
    Bytes(u64),
    Text(String),
}

/// `instances` as a number or `"max"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceCount {
    Count(i64),
    Text(String),
}

/// One application entry exactly as written in a descriptor file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppDescriptor {
    pub name: Option<String>,
    pub script: Option<String>,
    pub interpreter: Option<String>,
    pub args: Option<ArgList>,
    pub cwd: Option<String>,
    pub env: HashMap<String, EnvValue>,
    pub error_file: Option<String>,
    pub out_file: Option<String>,
    pub log_file: Option<String>,
    pub time: Option<bool>,
    pub autorestart: Option<bool>,
    pub watch: Option<bool>,
    pub ignore_watch: Option<Vec<String>>,
    pub max_memory_restart: Option<MemoryLimit>,
    pub exec_mode: Option<String>,
    pub instances: Option<InstanceCount>,
    pub kill_signal: Option<String>,
    /// Milliseconds
    pub kill_timeout: Option<u64>,
    /// Milliseconds
    pub restart_delay: Option<u64>,
    /// Milliseconds
    pub max_restart_delay: Option<u64>,
    pub max_restarts: Option<usize>,
    /// Milliseconds
    pub min_uptime: Option<u64>,
    pub stop_exit_codes: Option<Vec<i32>>,
}

impl AppDescriptor {
    /// Validate this entry and resolve it into an `ApplicationSpec`.
    ///
    /// Relative paths resolve against `base_dir` (for `cwd`) and then the
    /// resolved `cwd` (for everything else). Missing log paths default to
    /// files under `log_dir`.
    pub fn resolve(&self, base_dir: &Path, log_dir: &Path) -> Result<ApplicationSpec> {
        let name = match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(ShepherdError::MissingConfigField {
                    app: "<unnamed>".to_string(),
                    field: "name".to_string(),
                })
            }
        };

        let script = match self.script.as_deref().map(str::trim) {
            Some(script) if !script.is_empty() => script.to_string(),
            _ => {
                return Err(ShepherdError::MissingConfigField {
                    app: name,
                    field: "script".to_string(),
                })
            }
        };

        let max_memory_restart = match &self.max_memory_restart {
            None => None,
            Some(MemoryLimit::Bytes(0)) => {
                return Err(ShepherdError::InvalidMemoryLimit("0".to_string()))
            }
            Some(MemoryLimit::Bytes(bytes)) => Some(*bytes),
            Some(MemoryLimit::Text(text)) => Some(parse_memory(text)?),
        };

        let exec_mode = match &self.exec_mode {
            Some(mode) => ExecMode::parse(&name, mode)?,
            None => ExecMode::Fork,
        };

        let instances = resolve_instances(&name, self.instances.as_ref())?;

        let kill_signal = match &self.kill_signal {
            Some(signal) => {
                let signal = signal.trim().to_ascii_uppercase();
                if !VALID_SIGNALS.contains(&signal.as_str()) {
                    return Err(ShepherdError::Config(format!(
                        "Application '{}': invalid kill_signal '{}', must be one of: {}",
                        name,
                        signal,
                        VALID_SIGNALS.join(", ")
                    )));
                }
                signal
            }
            None => default_kill_signal(),
        };

        let restart_delay = self
            .restart_delay
            .map(Duration::from_millis)
            .unwrap_or_else(default_restart_delay);
        let max_restart_delay = self
            .max_restart_delay
            .map(Duration::from_millis)
            .unwrap_or_else(default_max_restart_delay);
        if restart_delay > max_restart_delay {
            return Err(ShepherdError::Config(format!(
                "Application '{}': restart_delay ({:?}) exceeds max_restart_delay ({:?})",
                name, restart_delay, max_restart_delay
            )));
        }

        // Filesystem checks last: a missing path only rejects this entry
        let cwd = match &self.cwd {
            Some(cwd) => absolutize(base_dir, &expand_env(cwd)),
            None => base_dir.to_path_buf(),
        };
        if !cwd.is_dir() {
            return Err(ShepherdError::PathNotFound { app: name, path: cwd });
        }

        let script = absolutize(&cwd, &expand_env(&script));
        if !script.exists() {
            return Err(ShepherdError::PathNotFound { app: name, path: script });
        }

        let interpreter = match self.interpreter.as_deref().map(str::trim) {
            None | Some("") | Some("none") => None,
            Some(interp) if interp.contains('/') => Some(absolutize(&cwd, &expand_env(interp))),
            Some(interp) => Some(PathBuf::from(interp)),
        };

        let log_path = |given: &Option<String>, suffix: &str| match given {
            Some(path) => absolutize(&cwd, &expand_env(path)),
            None => log_dir.join(format!("{}-{}.log", name, suffix)),
        };
        let logs = LogPaths {
            out: log_path(&self.out_file, "out"),
            err: log_path(&self.error_file, "error"),
            combined: log_path(&self.log_file, "combined"),
        };

        let env = self
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect();

        Ok(ApplicationSpec {
            script,
            interpreter,
            args: self.args.clone().map(ArgList::into_vec).unwrap_or_default(),
            cwd,
            env,
            logs,
            time: self.time.unwrap_or(false),
            autorestart: self.autorestart.unwrap_or_else(default_autorestart),
            watch: self.watch.unwrap_or(false),
            ignore_watch: self.ignore_watch.clone().unwrap_or_else(default_ignore_watch),
            max_memory_restart,
            exec_mode,
            instances,
            kill_signal,
            kill_timeout: self
                .kill_timeout
                .map(Duration::from_millis)
                .unwrap_or_else(default_kill_timeout),
            restart_delay,
            max_restart_delay,
            max_restarts: self.max_restarts.unwrap_or_else(default_max_restarts),
            min_uptime: self
                .min_uptime
                .map(Duration::from_millis)
                .unwrap_or_else(default_min_uptime),
            stop_exit_codes: self
                .stop_exit_codes
                .clone()
                .unwrap_or_else(default_stop_exit_codes),
            name,
        })
    }
}

fn resolve_instances(app: &str, value: Option<&InstanceCount>) -> Result<usize> {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let count = match value {
        None => 1,
        Some(InstanceCount::Text(text)) if text.trim().eq_ignore_ascii_case("max") => cpus,
        Some(InstanceCount::Text(text)) => match text.trim().parse::<i64>() {
            Ok(n) => instances_from_number(n, cpus),
            Err(_) => {
                return Err(ShepherdError::Config(format!(
                    "Application '{}': invalid instances '{}'",
                    app, text
                )))
            }
        },
        Some(InstanceCount::Count(n)) => instances_from_number(*n, cpus),
    };

    if count > MAX_INSTANCES {
        return Err(ShepherdError::Config(format!(
            "Application '{}': instances cannot exceed {}",
            app, MAX_INSTANCES
        )));
    }

    Ok(count)
}

/// `0` means one per CPU, `-n` means all CPUs but n
fn instances_from_number(n: i64, cpus: usize) -> usize {
    if n > 0 {
        n as usize
    } else if n == 0 {
        cpus
    } else {
        cpus.saturating_sub(n.unsigned_abs() as usize).max(1)
    }
}

/// Expand `$VAR` and `${VAR}` from the supervisor's environment; unknown
/// variables are left untouched
fn expand_env(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (var, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        let value = if var.is_empty() {
            None
        } else {
            std::env::var(var).ok()
        };

        match value {
            Some(value) => {
                result.push_str(&value);
                rest = &after[consumed..];
            }
            None => {
                result.push('$');
                rest = after;
            }
        }
    }

    result.push_str(rest);
    result
}

fn absolutize(base: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Descriptor file formats, picked by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorFormat {
    Json,
    Toml,
    Yaml,
}

impl DescriptorFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match extension {
            "json" => Ok(DescriptorFormat::Json),
            "toml" => Ok(DescriptorFormat::Toml),
            "yaml" | "yml" => Ok(DescriptorFormat::Yaml),
            _ => Err(ShepherdError::Config(format!(
                "Unsupported descriptor format '{}'. Use .json, .toml, .yaml or .yml",
                extension
            ))),
        }
    }
}

/// An entry that failed a filesystem check; the rest of the descriptor still loads
#[derive(Debug)]
pub struct RejectedApp {
    pub name: String,
    pub error: ShepherdError,
}

/// Result of loading a descriptor
#[derive(Debug)]
pub struct Descriptor {
    /// File the descriptor was read from, if any
    pub source: Option<PathBuf>,
    pub apps: Vec<ApplicationSpec>,
    pub rejected: Vec<RejectedApp>,
}

impl Descriptor {
    /// Load and validate a descriptor file.
    ///
    /// The descriptor's directory is the default working directory of its
    /// applications.
    pub fn from_file(path: &Path, log_dir: &Path) -> Result<Self> {
        let format = DescriptorFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ShepherdError::Config(format!(
                "Failed to read descriptor {}: {}",
                path.display(),
                e
            ))
        })?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base_dir = base_dir.canonicalize().unwrap_or(base_dir);

        let mut descriptor = Self::parse(&contents, format, &base_dir, log_dir)?;
        descriptor.source = Some(path.to_path_buf());
        Ok(descriptor)
    }

    /// Parse and validate descriptor text
    pub fn parse(
        contents: &str,
        format: DescriptorFormat,
        base_dir: &Path,
        log_dir: &Path,
    ) -> Result<Self> {
        let entries = parse_entries(contents, format)?;

        if entries.is_empty() {
            return Err(ShepherdError::Config(
                "No application found in descriptor".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in &entries {
            if let Some(name) = entry.name.as_deref().map(str::trim) {
                if !name.is_empty() && !seen.insert(name.to_string()) {
                    return Err(ShepherdError::Config(format!(
                        "Duplicate application name: {}",
                        name
                    )));
                }
            }
        }

        let mut apps = Vec::new();
        let mut rejected = Vec::new();

        for entry in entries {
            match entry.resolve(base_dir, log_dir) {
                Ok(spec) => apps.push(spec),
                Err(e @ ShepherdError::PathNotFound { .. }) => {
                    let name = entry.name.clone().unwrap_or_default();
                    rejected.push(RejectedApp { name, error: e });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            source: None,
            apps,
            rejected,
        })
    }

    /// Find a loaded application by name
    pub fn find(&self, name: &str) -> Option<&ApplicationSpec> {
        self.apps.iter().find(|app| app.name == name)
    }
}

fn parse_entries(contents: &str, format: DescriptorFormat) -> Result<Vec<AppDescriptor>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DescriptorFile {
        Apps { apps: Vec<AppDescriptor> },
        Single(AppDescriptor),
    }

    let file: DescriptorFile = match format {
        DescriptorFormat::Json => serde_json::from_str(contents)
            .map_err(|e| ShepherdError::Config(format!("Failed to parse JSON: {}", e)))?,
        DescriptorFormat::Toml => toml::from_str(contents)
            .map_err(|e| ShepherdError::Config(format!("Failed to parse TOML: {}", e)))?,
        DescriptorFormat::Yaml => serde_yaml::from_str(contents)
            .map_err(|e| ShepherdError::Config(format!("Failed to parse YAML: {}", e)))?,
    };

    Ok(match file {
        DescriptorFile::Apps { apps } => apps,
        DescriptorFile::Single(app) => vec![app],
    })
}
