//! cgroup v2 accounting files.
use std::{
    fs,
    path::{Path, PathBuf},
};

use super::DiskIoCounters;

/// Reads counters from a cgroup v2 directory (normally `/sys/fs/cgroup`).
#[derive(Debug, Clone)]
pub struct CgroupReader {
    root: PathBuf,
}

impl CgroupReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, file: &str) -> Option<String> {
        fs::read_to_string(self.root.join(file)).ok()
    }

    /// Whether cgroup v2 CPU accounting is exposed.
    pub fn has_cpu_accounting(&self) -> bool {
        self.root.join("cpu.stat").is_file()
    }

    /// Cumulative CPU time consumed by the cgroup, in microseconds.
    pub fn cpu_usage_usec(&self) -> Option<u64> {
        let content = self.read("cpu.stat")?;
        content.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("usage_usec"), Some(value)) => value.parse().ok(),
                _ => None,
            }
        })
    }

    /// Core-equivalent CPU limit from `cpu.max`; `None` when unlimited.
    pub fn cpu_quota(&self) -> Option<f64> {
        parse_cpu_max(&self.read("cpu.max")?)
    }

    /// Current memory usage in bytes.
    pub fn memory_current(&self) -> Option<u64> {
        self.read("memory.current")?.trim().parse().ok()
    }

    /// Memory limit in bytes; `None` when unlimited.
    pub fn memory_max(&self) -> Option<u64> {
        match self.read("memory.max")?.trim() {
            "max" => None,
            value => value.parse().ok(),
        }
    }

    /// Read/write bytes summed over every device in `io.stat`.
    pub fn io_totals(&self) -> Option<DiskIoCounters> {
        Some(parse_io_stat(&self.read("io.stat")?))
    }
}

/// Parses `cpu.max` (`"<quota> <period>"` or `"max <period>"`).
pub fn parse_cpu_max(content: &str) -> Option<f64> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: f64 = quota.parse().ok()?;
    let period: f64 = parts.next().unwrap_or("100000").parse().ok()?;
    if quota <= 0.0 || period <= 0.0 {
        return None;
    }
    Some(quota / period)
}

/// Sums `rbytes`/`wbytes` across the device lines of `io.stat`.
pub fn parse_io_stat(content: &str) -> DiskIoCounters {
    let mut totals = DiskIoCounters::default();
    for line in content.lines() {
        for field in line.split_whitespace().skip(1) {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            match key {
                "rbytes" => totals.read_bytes = totals.read_bytes.saturating_add(value),
                "wbytes" => totals.write_bytes = totals.write_bytes.saturating_add(value),
                _ => {}
            }
        }
    }
    totals
}

/// CPU utilisation of the cgroup between two usage readings, as a
/// percentage of the core-equivalent quota.
///
/// Returns `None` when no time elapsed, the counter went backwards or the
/// quota is not positive.
pub fn cpu_rate_percent(
    previous_usage_usec: u64,
    usage_usec: u64,
    elapsed_secs: f64,
    quota: f64,
) -> Option<f64> {
    if elapsed_secs <= 0.0 || quota <= 0.0 || usage_usec < previous_usage_usec {
        return None;
    }
    let used_secs = (usage_usec - previous_usage_usec) as f64 / 1_000_000.0;
    Some(used_secs / elapsed_secs / quota * 100.0)
}
