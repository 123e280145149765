//! Read-only view of the external process supervisor.
//!
//! The supervisor owns process lifecycles; the telemetry core only needs to
//! know which pid belongs to which managed process and how often it has been
//! restarted.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use crate::status::{StatusFile, normalize_name};

/// A process whose lifecycle is owned by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub pid: u32,
    pub name: String,
}

/// Collaborator interface exposed by the process supervisor.
pub trait ProcessSupervisor: Send + Sync {
    /// Live pid → name mapping of managed processes.
    fn processes(&self) -> Vec<ManagedProcess>;

    /// Restart statistics for `process_name`, if the supervisor tracks any.
    fn restart_stats(&self, process_name: &str) -> Option<Value>;
}

/// In-memory supervisor view, updated by the host application.
#[derive(Debug, Default)]
pub struct StaticSupervisor {
    processes: RwLock<BTreeMap<u32, String>>,
    restarts: RwLock<HashMap<String, Value>>,
}

impl StaticSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pid: u32, name: impl Into<String>) {
        self.processes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pid, name.into());
    }

    pub fn remove(&self, pid: u32) {
        self.processes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid);
    }

    pub fn set_restart_stats(&self, process_name: &str, stats: Value) {
        self.restarts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(normalize_name(process_name), stats);
    }
}

impl ProcessSupervisor for StaticSupervisor {
    fn processes(&self) -> Vec<ManagedProcess> {
        self.processes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(pid, name)| ManagedProcess {
                pid: *pid,
                name: name.clone(),
            })
            .collect()
    }

    fn restart_stats(&self, process_name: &str) -> Option<Value> {
        self.restarts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&normalize_name(process_name))
            .cloned()
    }
}

/// Supervisor view derived from the status document itself.
///
/// Used when the engine runs standalone: every entry with a pid counts as a
/// managed process. No restart statistics are available.
pub struct StatusFileSupervisor {
    file: Arc<StatusFile>,
}

impl StatusFileSupervisor {
    pub fn new(file: Arc<StatusFile>) -> Self {
        Self { file }
    }
}

impl ProcessSupervisor for StatusFileSupervisor {
    fn processes(&self) -> Vec<ManagedProcess> {
        self.file
            .refresh()
            .iter()
            .filter_map(|entry| {
                entry.pid.map(|pid| ManagedProcess {
                    pid,
                    name: entry.process_name.clone(),
                })
            })
            .collect()
    }

    fn restart_stats(&self, _process_name: &str) -> Option<Value> {
        None
    }
}
