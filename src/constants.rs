//! Constants and default values for the telemetry engine.
//!
//! This module centralizes the magic numbers, file names and fixed strings
//! used across the status, job, health, metrics and history components.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Default configuration file names, tried in order.
pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["pulse.yaml", "procpulse.yaml"];

/// Default location of the externally written status document.
pub const DEFAULT_STATUS_FILE: &str = "status.json";

/// Default directory holding history segments.
pub const DEFAULT_HISTORY_DIR: &str = "history";

/// Prefix of history segment file names.
pub const SEGMENT_PREFIX: &str = "metrics-";

/// Suffix of history segment file names.
pub const SEGMENT_SUFFIX: &str = ".jsonl";

/// Default cgroup v2 mount point.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default procfs mount point.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

// ============================================================================
// Job Registry
// ============================================================================

/// Maximum number of jobs retained by the job tracker.
pub const MAX_JOBS: usize = 500;

/// Age after which finished jobs become eligible for eviction.
pub const TERMINAL_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Health Probing
// ============================================================================

/// Upper bound on a single TCP reachability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Host probed when configuration does not name one.
pub const DEFAULT_PROBE_HOST: &str = "127.0.0.1";

/// Reason reported for intentionally idle processes.
pub const REASON_IDLE: &str = "Process idle";

/// Reason reported when the status document does not list the process as running.
pub const REASON_NOT_RUNNING: &str = "Process not running";

/// Reason reported when the recorded pid no longer exists.
pub const REASON_PID_NOT_RUNNING: &str = "Process PID not running";

/// Reason reported for zombie or stopped processes.
pub const REASON_NOT_HEALTHY: &str = "Process not healthy";

/// Reason reported when the OS refuses to describe the pid.
pub const REASON_NOT_INSPECTABLE: &str = "Process could not be inspected";

// ============================================================================
// Metrics Sampling
// ============================================================================

/// Default number of unmanaged processes included in a snapshot.
pub const DEFAULT_EXTERNAL_LIMIT: usize = 20;

/// Sector size used by `/proc/diskstats` counters.
pub const DISKSTATS_SECTOR_BYTES: u64 = 512;

// ============================================================================
// History Queries
// ============================================================================

/// Default look-back window when a query does not pass `since`.
pub const DEFAULT_HISTORY_HOURS: f64 = 24.0;

/// Default cap on records returned by a history read.
pub const DEFAULT_HISTORY_LIMIT: usize = 20_000;

/// Default size at which the segment writer rotates to a new file.
pub const DEFAULT_SEGMENT_BYTES: u64 = 4 * 1024 * 1024;

/// Default total size budget for the segment directory.
pub const DEFAULT_HISTORY_MAX_BYTES: u64 = 256 * 1024 * 1024;

// ============================================================================
// Snapshot Publishing
// ============================================================================

/// Fastest allowed polling interval for the snapshot publisher.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Slowest allowed polling interval for the snapshot publisher.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default polling interval for the snapshot publisher.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Granularity of the publisher's interruptible sleep.
pub const POLL_SLEEP_STEP: Duration = Duration::from_millis(100);

/// Capacity of the bounded channel behind a `ChannelObserver`.
pub const OBSERVER_CHANNEL_CAPACITY: usize = 16;
