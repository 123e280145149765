//! Configuration management for procpulse.
//!
//! The telemetry core only *reads* configuration. Everything it needs goes
//! through the [`ConfigSource`] trait so the host application can plug in its
//! own store; [`FileConfig`] is the YAML-backed implementation used by the
//! `pulse` binary and the tests.
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::constants::{
    DEFAULT_CGROUP_ROOT, DEFAULT_CONFIG_FILES, DEFAULT_EXTERNAL_LIMIT,
    DEFAULT_HISTORY_DIR, DEFAULT_HISTORY_HOURS, DEFAULT_HISTORY_LIMIT,
    DEFAULT_HISTORY_MAX_BYTES, DEFAULT_POLL_INTERVAL, DEFAULT_PROBE_TIMEOUT,
    DEFAULT_PROC_ROOT, DEFAULT_SEGMENT_BYTES, DEFAULT_STATUS_FILE,
};
use crate::error::ConfigError;
use crate::status::normalize_name;

/// Read-only view of the host application's configuration.
pub trait ConfigSource: Send + Sync {
    /// Looks up a value by dotted path (e.g. `dbrepair.enabled`).
    fn get(&self, key: &str) -> Option<Value>;

    /// Finds the service key and instance name that manage `process_name`.
    fn find_key_for_process(&self, process_name: &str) -> Option<(String, String)>;

    /// Returns the configuration record of one instance of a service key.
    fn get_instance(&self, instance_name: &str, key: &str) -> Option<ProcessConfig>;

    /// Convenience lookup combining [`find_key_for_process`] and [`get_instance`].
    ///
    /// [`find_key_for_process`]: ConfigSource::find_key_for_process
    /// [`get_instance`]: ConfigSource::get_instance
    fn process_config(&self, process_name: &str) -> Option<ProcessConfig> {
        let (key, instance) = self.find_key_for_process(process_name)?;
        self.get_instance(&instance, &key)
    }

    /// Returns `true` when the value at `key` is set to something truthy.
    fn flag(&self, key: &str) -> bool {
        self.get(key).map(|value| is_truthy(&value)).unwrap_or(false)
    }
}

/// Interprets loosely typed configuration values as booleans.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        _ => false,
    }
}

/// Which measurement scope system metrics are taken in.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, serde::Serialize,
    EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MetricsScope {
    /// Host-wide counters.
    Host,
    /// Counters of the cgroup the engine runs in.
    Cgroup,
    /// Cgroup when the host exposes cgroup v2 CPU accounting, host otherwise.
    #[default]
    Auto,
}

/// Configuration for an individual managed process instance.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProcessConfig {
    /// Process name as reported by the supervisor.
    pub process_name: String,
    /// Host the process binds to.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub frontend_port: Option<u16>,
    pub backend_port: Option<u16>,
    pub webdav_port: Option<u16>,
    /// Environment passed to the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub config_dir: Option<String>,
    pub config_file: Option<String>,
    pub log_file: Option<String>,
}

impl ProcessConfig {
    /// Configured ports in declaration order, without duplicates.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for port in [
            self.port,
            self.frontend_port,
            self.backend_port,
            self.webdav_port,
        ]
        .into_iter()
        .flatten()
        {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports
    }
}

/// A service key groups one or more named instances.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceSection {
    #[serde(default)]
    pub instances: BTreeMap<String, ProcessConfig>,
}

/// Settings for the metrics sampler.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsSettings {
    pub scope: MetricsScope,
    pub external_limit: usize,
    pub cgroup_root: PathBuf,
    pub proc_root: PathBuf,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            scope: MetricsScope::Auto,
            external_limit: DEFAULT_EXTERNAL_LIMIT,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
        }
    }
}

/// Settings for the health checker.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthSettings {
    pub probe_timeout_ms: u64,
}

impl HealthSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Settings for history reads and the segment writer.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistorySettings {
    pub default_hours: f64,
    pub limit: usize,
    pub bucket_seconds: Option<u64>,
    pub max_points: Option<usize>,
    pub segment_bytes: u64,
    pub max_bytes: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            default_hours: DEFAULT_HISTORY_HOURS,
            limit: DEFAULT_HISTORY_LIMIT,
            bucket_seconds: None,
            max_points: None,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            max_bytes: DEFAULT_HISTORY_MAX_BYTES,
        }
    }
}

/// Settings for the `watch` polling loop.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatchSettings {
    pub interval_secs: f64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL.as_secs_f64(),
        }
    }
}

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Path of the status document written by the supervisor.
    pub status_file: Option<PathBuf>,
    /// Directory holding `metrics-*.jsonl` segments.
    pub history_dir: Option<PathBuf>,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub watch: WatchSettings,
    /// Map of service keys to their instances.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSection>,
    /// Root directory from which relative paths are resolved.
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

impl Config {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.project_dir {
            Some(base) => base.join(path),
            None => path.to_path_buf(),
        }
    }

    /// Resolved path of the status document.
    pub fn status_path(&self) -> PathBuf {
        let raw = self
            .status_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATUS_FILE));
        self.resolve(&raw)
    }

    /// Resolved history segment directory.
    pub fn history_path(&self) -> PathBuf {
        let raw = self
            .history_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_DIR));
        self.resolve(&raw)
    }
}

/// YAML-backed [`ConfigSource`].
#[derive(Debug, Default)]
pub struct FileConfig {
    config: Config,
    raw: Value,
}

impl FileConfig {
    /// Parses configuration from YAML text, with `project_dir` used to resolve
    /// relative paths.
    pub fn from_yaml(
        content: &str,
        project_dir: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content)?;
        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.project_dir = project_dir;
        let raw: Value = serde_yaml::from_str(&expanded)?;
        Ok(Self { config, raw })
    }

    /// Typed settings.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl ConfigSource for FileConfig {
    fn get(&self, key: &str) -> Option<Value> {
        let mut current = &self.raw;
        for segment in key.split('.').filter(|segment| !segment.is_empty()) {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        if current.is_null() {
            None
        } else {
            Some(current.clone())
        }
    }

    fn find_key_for_process(&self, process_name: &str) -> Option<(String, String)> {
        let wanted = normalize_name(process_name);
        if wanted.is_empty() {
            return None;
        }
        self.config.services.iter().find_map(|(key, section)| {
            section
                .instances
                .iter()
                .find(|(_, instance)| normalize_name(&instance.process_name) == wanted)
                .map(|(instance_name, _)| (key.clone(), instance_name.clone()))
        })
    }

    fn get_instance(&self, instance_name: &str, key: &str) -> Option<ProcessConfig> {
        self.config
            .services
            .get(key)?
            .instances
            .get(instance_name)
            .cloned()
    }
}

/// Expands `$VAR` and `${VAR}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .expect("environment variable pattern is valid");
    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(result.to_string()),
    }
}

/// Locates the configuration file, falling back to the default names.
pub fn resolve_config_path(config_path: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = config_path {
        return Some(PathBuf::from(path));
    }
    DEFAULT_CONFIG_FILES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
}

/// Loads and parses the configuration file, expanding environment variables.
///
/// With no explicit path and no default file present, an empty configuration
/// rooted at the current directory is returned.
pub fn load_config(config_path: Option<&str>) -> Result<FileConfig, ConfigError> {
    let Some(config_path) = resolve_config_path(config_path) else {
        return FileConfig::from_yaml("{}", env::current_dir().ok());
    };

    let content = fs::read_to_string(&config_path).map_err(|e| {
        ConfigError::ReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    FileConfig::from_yaml(&content, Some(base_path))
}
