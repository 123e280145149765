//! Bounded registry of asynchronous background jobs.
//!
//! Jobs are created by callers that kick off long-running work (symlink
//! repair, backups, updates) and polled until they reach a terminal state.
//! The registry keeps at most [`MAX_JOBS`] entries, evicting stale finished
//! jobs first and then the least recently updated ones.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Mutex};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::debug;
use uuid::Uuid;

use crate::constants::{MAX_JOBS, TERMINAL_JOB_TTL};
use crate::status::normalize_name;

/// Lifecycle state of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    /// Queued and running jobs are active.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Completed and failed jobs are terminal.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// A tracked background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub process_name: String,
    pub operation: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Fields supplied by updates that have no dedicated slot.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug)]
struct JobEntry {
    /// Creation sequence number, used to break `updated_at` ties.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Registry {
    next_seq: u64,
    jobs: HashMap<String, JobEntry>,
}

impl Registry {
    fn evict(&mut self, capacity: usize, now: DateTime<Utc>) {
        let ttl = ChronoDuration::from_std(TERMINAL_JOB_TTL)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        let cutoff = now - ttl;
        let before = self.jobs.len();
        self.jobs
            .retain(|_, entry| !(entry.job.status.is_terminal() && entry.job.updated_at < cutoff));

        if self.jobs.len() >= capacity {
            let mut by_age: Vec<(DateTime<Utc>, u64, String)> = self
                .jobs
                .values()
                .map(|entry| (entry.job.updated_at, entry.seq, entry.job.job_id.clone()))
                .collect();
            by_age.sort();
            let excess = self.jobs.len() + 1 - capacity;
            for (_, _, job_id) in by_age.into_iter().take(excess) {
                self.jobs.remove(&job_id);
            }
        }

        let evicted = before - self.jobs.len();
        if evicted > 0 {
            debug!("evicted {evicted} job(s) from the job registry");
        }
    }
}

/// Thread-safe, size- and age-bounded job registry.
#[derive(Debug)]
pub struct JobTracker {
    capacity: usize,
    registry: Mutex<Registry>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_capacity(MAX_JOBS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            registry: Mutex::new(Registry::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of retained jobs.
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a new queued job and returns a copy of it.
    pub fn create(
        &self,
        process_name: &str,
        operation: &str,
        metadata: Map<String, Value>,
    ) -> Job {
        let now = Utc::now();
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            process_name: process_name.trim().to_string(),
            operation: operation.to_string(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            metadata,
            result: None,
            error: None,
            extra: Map::new(),
        };

        let mut registry = self.lock();
        registry.evict(self.capacity, now);
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry.jobs.insert(
            job.job_id.clone(),
            JobEntry {
                seq,
                job: job.clone(),
            },
        );
        job
    }

    /// Merges the top-level fields of `patch` into a job.
    ///
    /// `jobId` and `createdAt` cannot be changed. Returns `None` for an empty
    /// or unknown id, a non-object patch, or a patch that would leave the job
    /// invalid; in those cases the registry is untouched.
    pub fn update(&self, job_id: &str, patch: Value) -> Option<Job> {
        if job_id.is_empty() {
            return None;
        }
        let Value::Object(patch) = patch else {
            return None;
        };

        let mut registry = self.lock();
        let entry = registry.jobs.get_mut(job_id)?;

        let Value::Object(mut merged) = serde_json::to_value(&entry.job).ok()? else {
            return None;
        };
        for (field, value) in patch {
            if field == "jobId" || field == "createdAt" {
                continue;
            }
            merged.insert(field, value);
        }
        merged.insert(
            "updatedAt".into(),
            serde_json::to_value(Utc::now()).ok()?,
        );

        match serde_json::from_value::<Job>(Value::Object(merged)) {
            Ok(updated) => {
                entry.job = updated;
                Some(entry.job.clone())
            }
            Err(err) => {
                debug!("ignoring invalid update for job {job_id}: {err}");
                None
            }
        }
    }

    /// Convenience wrapper around [`JobTracker::update`] for status changes.
    pub fn set_status(&self, job_id: &str, status: JobStatus) -> Option<Job> {
        debug!("job {job_id} -> {status}");
        self.update(job_id, serde_json::json!({ "status": status }))
    }

    /// Returns a copy of the job with `job_id`.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|entry| entry.job.clone())
    }

    /// Most recently updated job for a process, optionally filtered by
    /// operation and restricted to active jobs.
    ///
    /// Ties on `updated_at` go to the job created last.
    pub fn get_latest(
        &self,
        process_name: &str,
        operation: Option<&str>,
        active_only: bool,
    ) -> Option<Job> {
        let key = normalize_name(process_name);
        let registry = self.lock();
        registry
            .jobs
            .values()
            .filter(|entry| normalize_name(&entry.job.process_name) == key)
            .filter(|entry| operation.is_none_or(|operation| entry.job.operation == operation))
            .filter(|entry| !active_only || entry.job.status.is_active())
            .max_by_key(|entry| (entry.job.updated_at, entry.seq))
            .map(|entry| entry.job.clone())
    }
}
