//! Entry point wiring the status, job, health, metrics and history components
//! around one configuration and one supervisor view.
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::{Config, ConfigSource, FileConfig, load_config};
use crate::error::TelemetryError;
use crate::health::HealthChecker;
use crate::history::{self, HistoryQuery, HistoryResponse, SegmentWriter};
use crate::jobs::JobTracker;
use crate::metrics::{MetricsSampler, MetricsSnapshot};
use crate::status::{RecordCache, StatusDetails, StatusFile, StatusStore};
use crate::supervisor::{ProcessSupervisor, StatusFileSupervisor};

/// Telemetry engine facade.
///
/// Every component guards its own state, so callers on different threads only
/// contend when they touch the same component.
pub struct Telemetry {
    config: Arc<FileConfig>,
    status: StatusStore,
    jobs: JobTracker,
    update_status: RecordCache,
    symlink_backup: RecordCache,
    health: Arc<HealthChecker>,
    sampler: Mutex<MetricsSampler>,
}

impl Telemetry {
    /// Builds the engine on top of an explicit supervisor view.
    pub fn new(config: Arc<FileConfig>, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        let status_file = Arc::new(StatusFile::new(config.config().status_path()));
        Self::with_status_file(config, status_file, supervisor)
    }

    /// Builds a standalone engine whose managed processes are the entries of
    /// the status document.
    pub fn standalone(config: Arc<FileConfig>) -> Self {
        let status_file = Arc::new(StatusFile::new(config.config().status_path()));
        let supervisor = Arc::new(StatusFileSupervisor::new(Arc::clone(&status_file)));
        Self::with_status_file(config, status_file, supervisor)
    }

    /// Loads the configuration file and builds a standalone engine.
    pub fn load(config_path: Option<&str>) -> Result<Self, TelemetryError> {
        let config = Arc::new(load_config(config_path)?);
        Ok(Self::standalone(config))
    }

    fn with_status_file(
        config: Arc<FileConfig>,
        status_file: Arc<StatusFile>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        let source: Arc<dyn ConfigSource> = config.clone();
        let settings = config.config();
        debug!(
            "telemetry using status file {} and history dir {}",
            status_file.path().display(),
            settings.history_path().display()
        );

        let health = Arc::new(HealthChecker::new(
            Arc::clone(&source),
            settings.health.probe_timeout(),
        ));
        let status = StatusStore::new(
            status_file,
            Arc::clone(&source),
            Arc::clone(&supervisor),
            Arc::clone(&health),
        );
        let sampler = MetricsSampler::new(supervisor, source, settings.metrics.clone());

        Self {
            status,
            jobs: JobTracker::new(),
            update_status: RecordCache::new(),
            symlink_backup: RecordCache::new(),
            health,
            sampler: Mutex::new(sampler),
            config,
        }
    }

    /// Typed configuration the engine was built from.
    pub fn config(&self) -> &Config {
        self.config.config()
    }

    pub fn status_store(&self) -> &StatusStore {
        &self.status
    }

    /// Status (and optionally health) of one process.
    pub fn status(&self, process_name: &str, include_health: bool) -> StatusDetails {
        self.status.get_status_details(process_name, include_health)
    }

    /// Status of every process in the status document.
    pub fn status_snapshot(&self, include_health: bool) -> Vec<StatusDetails> {
        self.status.snapshot(include_health)
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Last reported update check per process.
    pub fn update_status(&self) -> &RecordCache {
        &self.update_status
    }

    /// Last reported symlink backup per process.
    pub fn symlink_backup(&self) -> &RecordCache {
        &self.symlink_backup
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// Samples system and process metrics.
    pub fn metrics_snapshot(
        &self,
        external_limit: usize,
    ) -> Result<MetricsSnapshot, TelemetryError> {
        let mut sampler = self.sampler.lock()?;
        Ok(sampler.snapshot(external_limit))
    }

    /// Default history query derived from configuration.
    pub fn history_query(&self) -> HistoryQuery {
        HistoryQuery::from_settings(&self.config().history)
    }

    /// Queries the configured history directory.
    pub fn history(&self, query: &HistoryQuery) -> HistoryResponse {
        history::query(&self.config().history_path(), query)
    }

    /// Opens a segment writer on the configured history directory.
    pub fn history_writer(&self) -> Result<SegmentWriter, TelemetryError> {
        let settings = &self.config().history;
        Ok(SegmentWriter::new(
            self.config().history_path(),
            settings.segment_bytes,
            settings.max_bytes,
        )?)
    }
}
