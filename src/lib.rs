//! Procpulse tracks the liveness and health of externally supervised
//! processes, samples host-, cgroup- and process-level resource usage, and
//! replays recorded samples as downsampled time series. The `pulse` binary
//! exposes the same engine from the command line.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Constants and default values.
pub mod constants;

/// Error handling.
pub mod error;

/// Health classification of managed processes.
pub mod health;

/// Metrics history segments and time-series queries.
pub mod history;

/// Bounded registry of background jobs.
pub mod jobs;

/// System, cgroup and process metrics sampling.
pub mod metrics;

/// Periodic snapshot broadcasting to observers.
pub mod publisher;

/// Status document cache and status queries.
pub mod status;

/// Read-only view of the process supervisor.
pub mod supervisor;

/// Facade wiring the telemetry components together.
pub mod telemetry;
