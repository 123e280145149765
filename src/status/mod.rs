//! Status tracking for supervised processes.
//!
//! The supervisor writes a JSON object `{ "<process name>": <pid>, ... }` to
//! disk. [`StatusFile`] mirrors that document in memory and only re-parses it
//! when the file's modification signature changes; [`StatusStore`] answers
//! status and health queries on top of it.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::SystemTime,
};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

use crate::config::ConfigSource;
use crate::health::HealthChecker;
use crate::supervisor::ProcessSupervisor;

mod records;

pub use records::RecordCache;

/// Names that are reported as running whether or not the status file lists them.
const ALWAYS_RUNNING: [&str; 2] = ["dumbapi", "dmbapi"];

/// Names that are reported as idle while the repair flag is enabled.
const IDLE_WHEN_ENABLED: [&str; 2] = ["plexdbrepair", "dbrepair"];

/// Configuration key gating the idle aliases.
const IDLE_FLAG_KEY: &str = "dbrepair.enabled";

/// Canonical form used whenever two process names are compared.
///
/// Surrounding whitespace is stripped, `"/ "` collapses to `"/"`, the
/// remaining spaces are removed and the result is lower-cased.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .replace("/ ", "/")
        .replace(' ', "")
        .to_lowercase()
}

/// Reported state of a managed process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Idle,
    Stopped,
}

/// One entry of the status document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatusEntry {
    pub process_name: String,
    pub pid: Option<u32>,
}

/// Freshness signal of the status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSignature {
    modified: Option<SystemTime>,
    len: u64,
}

#[derive(Debug, Default)]
struct CachedDocument {
    signature: Option<FileSignature>,
    entries: Arc<Vec<ProcessStatusEntry>>,
}

/// Read-through cache of the externally written status document.
#[derive(Debug)]
pub struct StatusFile {
    path: PathBuf,
    cache: RwLock<CachedDocument>,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(CachedDocument::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current entries, re-reading the document only if it changed.
    pub fn refresh(&self) -> Arc<Vec<ProcessStatusEntry>> {
        let signature = match self.signature() {
            Some(signature) => signature,
            None => return self.cached(),
        };

        if let Ok(guard) = self.cache.read()
            && guard.signature == Some(signature)
        {
            return Arc::clone(&guard.entries);
        }

        let entries = Arc::new(self.parse());
        let mut guard = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.signature = Some(signature);
        guard.entries = Arc::clone(&entries);
        entries
    }

    fn cached(&self) -> Arc<Vec<ProcessStatusEntry>> {
        self.cache
            .read()
            .map(|guard| Arc::clone(&guard.entries))
            .unwrap_or_default()
    }

    fn signature(&self) -> Option<FileSignature> {
        match fs::metadata(&self.path) {
            Ok(metadata) => Some(FileSignature {
                modified: metadata.modified().ok(),
                len: metadata.len(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.initialize();
                fs::metadata(&self.path).ok().map(|metadata| FileSignature {
                    modified: metadata.modified().ok(),
                    len: metadata.len(),
                })
            }
            Err(err) => {
                warn!("Failed to stat status file {}: {err}", self.path.display());
                None
            }
        }
    }

    fn initialize(&self) {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!(
                "Failed to create status directory {}: {err}",
                parent.display()
            );
            return;
        }
        match fs::write(&self.path, "{}") {
            Ok(()) => debug!("Initialized empty status file {}", self.path.display()),
            Err(err) => warn!(
                "Failed to initialize status file {}: {err}",
                self.path.display()
            ),
        }
    }

    fn parse(&self) -> Vec<ProcessStatusEntry> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("Failed to read status file {}: {err}", self.path.display());
                return Vec::new();
            }
        };
        if contents.trim().is_empty() {
            return Vec::new();
        }

        match serde_json::from_str::<Map<String, Value>>(&contents) {
            Ok(document) => document
                .into_iter()
                .map(|(process_name, pid)| ProcessStatusEntry {
                    process_name,
                    pid: pid.as_u64().and_then(|pid| u32::try_from(pid).ok()),
                })
                .collect(),
            Err(err) => {
                warn!("Failed to parse status file {}: {err}", self.path.display());
                Vec::new()
            }
        }
    }
}

/// Status and health details for one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetails {
    pub process_name: String,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<Value>,
}

/// Answers status queries against the cached status document.
pub struct StatusStore {
    file: Arc<StatusFile>,
    config: Arc<dyn ConfigSource>,
    supervisor: Arc<dyn ProcessSupervisor>,
    health: Arc<HealthChecker>,
}

impl StatusStore {
    pub fn new(
        file: Arc<StatusFile>,
        config: Arc<dyn ConfigSource>,
        supervisor: Arc<dyn ProcessSupervisor>,
        health: Arc<HealthChecker>,
    ) -> Self {
        Self {
            file,
            config,
            supervisor,
            health,
        }
    }

    /// Current status entries in document order.
    pub fn refresh(&self) -> Arc<Vec<ProcessStatusEntry>> {
        self.file.refresh()
    }

    /// Returns `true` if `name` matches a status entry or an always-running alias.
    pub fn is_running(&self, name: &str) -> bool {
        let key = normalize_name(name);
        if key.is_empty() {
            return false;
        }
        if ALWAYS_RUNNING.contains(&key.as_str()) {
            return true;
        }
        self.find_entry(&key).is_some()
    }

    /// Returns `true` for the repair aliases while their configuration flag is on.
    pub fn is_idle(&self, name: &str) -> bool {
        let key = normalize_name(name);
        IDLE_WHEN_ENABLED.contains(&key.as_str()) && self.config.flag(IDLE_FLAG_KEY)
    }

    /// Resolves the reported status of `name` and the pid recorded for it.
    pub fn status_of(&self, name: &str) -> (ProcessStatus, Option<ProcessStatusEntry>) {
        let key = normalize_name(name);
        if key.is_empty() {
            return (ProcessStatus::Stopped, None);
        }
        if self.is_idle(name) {
            return (ProcessStatus::Idle, self.find_entry(&key));
        }
        match self.find_entry(&key) {
            Some(entry) => (ProcessStatus::Running, Some(entry)),
            None if ALWAYS_RUNNING.contains(&key.as_str()) => (ProcessStatus::Running, None),
            None => (ProcessStatus::Stopped, None),
        }
    }

    /// Builds the status payload for one process, optionally with health and
    /// restart statistics.
    pub fn get_status_details(&self, name: &str, include_health: bool) -> StatusDetails {
        let (status, entry) = self.status_of(name);
        let process_name = entry
            .as_ref()
            .map(|entry| entry.process_name.clone())
            .unwrap_or_else(|| name.trim().to_string());
        let pid = self
            .supervisor_pid(&process_name)
            .or_else(|| entry.as_ref().and_then(|entry| entry.pid));

        let mut details = StatusDetails {
            process_name,
            status,
            pid,
            healthy: None,
            health_reason: None,
            restart: None,
        };

        if include_health {
            let verdict = self.health.check(&details.process_name, status, pid);
            details.healthy = Some(verdict.healthy);
            details.health_reason = verdict.reason;
            details.restart = self.supervisor.restart_stats(&details.process_name);
        }

        details
    }

    /// Details for every entry of the status document, in document order.
    pub fn snapshot(&self, include_health: bool) -> Vec<StatusDetails> {
        self.refresh()
            .iter()
            .map(|entry| self.get_status_details(&entry.process_name, include_health))
            .collect()
    }

    fn find_entry(&self, key: &str) -> Option<ProcessStatusEntry> {
        self.refresh()
            .iter()
            .find(|entry| normalize_name(&entry.process_name) == key)
            .cloned()
    }

    fn supervisor_pid(&self, process_name: &str) -> Option<u32> {
        let key = normalize_name(process_name);
        self.supervisor
            .processes()
            .into_iter()
            .find(|process| normalize_name(&process.name) == key)
            .map(|process| process.pid)
    }
}
