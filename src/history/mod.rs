//! Replays metrics snapshots from `metrics-*.jsonl` segments and turns them
//! into chart-ready series.
//!
//! Segments may be written by [`SegmentWriter`] or by an external process;
//! this module never modifies them. Records are ordered by their embedded
//! `timestamp`, not by file position.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::config::HistorySettings;
use crate::constants::{SEGMENT_PREFIX, SEGMENT_SUFFIX};
use crate::metrics::unix_timestamp;

mod writer;

pub use writer::SegmentWriter;

/// Parameters of a history read.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    /// Oldest timestamp to include; overrides the default window.
    pub since: Option<f64>,
    /// Read every record instead of the default window.
    pub full: bool,
    /// Maximum number of records to return; `0` means no cap.
    pub limit: usize,
    /// Size of the default window in hours.
    pub default_hours: f64,
    /// Width of downsampling buckets in seconds.
    pub bucket_seconds: Option<u64>,
    /// Upper bound on returned points after bucketing.
    pub max_points: Option<usize>,
}

impl HistoryQuery {
    pub fn from_settings(settings: &HistorySettings) -> Self {
        Self {
            since: None,
            full: false,
            limit: settings.limit,
            default_hours: settings.default_hours,
            bucket_seconds: settings.bucket_seconds,
            max_points: settings.max_points,
        }
    }

    /// Lower timestamp bound, or `None` when every record qualifies.
    pub fn effective_since(&self, now: f64) -> Option<f64> {
        match (self.since, self.full) {
            (Some(since), _) => Some(since),
            (None, true) => None,
            (None, false) => Some(now - self.default_hours * 3600.0),
        }
    }
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self::from_settings(&HistorySettings::default())
    }
}

/// Raw records returned by [`read_history`], ascending by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryRead {
    pub since: Option<f64>,
    pub truncated: bool,
    pub items: Vec<Value>,
}

/// Segment files under `dir`, sorted by name.
pub fn list_segments(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("history directory {} unavailable: {err}", dir.display());
            return Vec::new();
        }
    };
    let mut segments: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX)
        })
        .map(|entry| entry.path())
        .collect();
    segments.sort();
    segments
}

fn record_timestamp(record: &Value) -> Option<f64> {
    record.get("timestamp").and_then(Value::as_f64)
}

/// Reads the newest records matching `query` from the segments in `dir`.
///
/// Segments are scanned newest-first so that a capped read keeps the most
/// recent records. `truncated` is set only when a further matching record
/// existed beyond the cap.
pub fn read_history(dir: &Path, query: &HistoryQuery) -> HistoryRead {
    let since = query.effective_since(unix_timestamp());
    let mut items: Vec<Value> = Vec::new();
    let mut truncated = false;

    'segments: for segment in list_segments(dir).iter().rev() {
        let content = match fs::read(segment) {
            Ok(content) => content,
            Err(err) => {
                warn!("skipping unreadable segment {}: {err}", segment.display());
                continue;
            }
        };
        for line in content.split(|byte| *byte == b'\n').rev() {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            let record: Value = match serde_json::from_slice(line) {
                Ok(record) => record,
                Err(err) => {
                    debug!("skipping malformed line in {}: {err}", segment.display());
                    continue;
                }
            };
            let Some(timestamp) = record_timestamp(&record) else {
                continue;
            };
            if since.is_some_and(|since| timestamp < since) {
                continue;
            }
            if query.limit > 0 && items.len() >= query.limit {
                truncated = true;
                break 'segments;
            }
            items.push(record);
        }
    }

    items.sort_by(|a, b| {
        record_timestamp(a)
            .unwrap_or_default()
            .total_cmp(&record_timestamp(b).unwrap_or_default())
    });
    HistoryRead {
        since,
        truncated,
        items,
    }
}

/// Anything carrying a unix-seconds timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> Option<f64>;
}

impl Timestamped for Value {
    fn timestamp(&self) -> Option<f64> {
        record_timestamp(self)
    }
}

impl Timestamped for CompactSample {
    fn timestamp(&self) -> Option<f64> {
        Some(self.timestamp)
    }
}

/// Reduces `items` (ascending by timestamp) to fewer points.
///
/// With `bucket_seconds`, the last item of each `floor(timestamp / bucket)`
/// bucket is kept. With `max_points`, every `ceil(n / max_points)`-th item is
/// kept and the final item is always included.
pub fn downsample<T: Timestamped>(
    items: Vec<T>,
    bucket_seconds: Option<u64>,
    max_points: Option<usize>,
) -> Vec<T> {
    let mut items = match bucket_seconds.filter(|bucket| *bucket > 0) {
        Some(bucket) => {
            let bucket = bucket as f64;
            let mut buckets: BTreeMap<i64, T> = BTreeMap::new();
            for item in items {
                if let Some(timestamp) = item.timestamp() {
                    buckets.insert((timestamp / bucket).floor() as i64, item);
                }
            }
            buckets.into_values().collect()
        }
        None => items,
    };

    let Some(max_points) = max_points.filter(|max| *max > 0) else {
        return items;
    };
    if items.len() <= max_points {
        return items;
    }
    let step = items.len().div_ceil(max_points);
    let Some(last) = items.pop() else {
        return items;
    };
    let mut sampled: Vec<T> = items.into_iter().step_by(step).collect();
    sampled.push(last);
    sampled
}

/// System fields kept by [`compact`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactSystem {
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub disk_read_bytes: Option<f64>,
    pub disk_write_bytes: Option<f64>,
    pub net_sent_bytes: Option<f64>,
    pub net_recv_bytes: Option<f64>,
}

/// Per-process fields kept by [`compact`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactProcess {
    pub name: String,
    pub pid: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub memory_rss: Option<u64>,
    pub read_bytes: Option<u64>,
    pub write_bytes: Option<u64>,
}

/// A snapshot projected down to what charts need.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactSample {
    pub timestamp: f64,
    pub system: CompactSystem,
    pub managed: Vec<CompactProcess>,
    pub external: Vec<CompactProcess>,
}

fn number(record: &Value, pointer: &str) -> Option<f64> {
    record.pointer(pointer).and_then(Value::as_f64)
}

fn compact_processes(record: &Value, key: &str) -> Vec<CompactProcess> {
    let Some(Value::Array(processes)) = record.get(key) else {
        return Vec::new();
    };
    processes
        .iter()
        .map(|process| CompactProcess {
            name: process
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            pid: process.get("pid").and_then(Value::as_u64),
            cpu_percent: number(process, "/cpuPercent"),
            memory_rss: process.get("memoryRss").and_then(Value::as_u64),
            read_bytes: process.pointer("/ioCounters/readBytes").and_then(Value::as_u64),
            write_bytes: process
                .pointer("/ioCounters/writeBytes")
                .and_then(Value::as_u64),
        })
        .collect()
}

/// Projects full snapshot records to [`CompactSample`]s, skipping records
/// without a timestamp.
pub fn compact(items: &[Value]) -> Vec<CompactSample> {
    items
        .iter()
        .filter_map(|record| {
            Some(CompactSample {
                timestamp: record_timestamp(record)?,
                system: CompactSystem {
                    cpu_percent: number(record, "/system/cpuPercent"),
                    mem_percent: number(record, "/system/memory/percent"),
                    disk_percent: number(record, "/system/disk/percent"),
                    disk_read_bytes: number(record, "/system/diskIo/readBytes"),
                    disk_write_bytes: number(record, "/system/diskIo/writeBytes"),
                    net_sent_bytes: number(record, "/system/netIo/bytesSent"),
                    net_recv_bytes: number(record, "/system/netIo/bytesRecv"),
                },
                managed: compact_processes(record, "managedProcesses"),
                external: compact_processes(record, "externalProcesses"),
            })
        })
        .collect()
}

/// Parallel arrays, one entry per sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Series {
    pub timestamps: Vec<f64>,
    pub cpu_percent: Vec<Option<f64>>,
    pub mem_percent: Vec<Option<f64>>,
    pub disk_percent: Vec<Option<f64>>,
    pub disk_read_rate: Vec<Option<f64>>,
    pub disk_write_rate: Vec<Option<f64>>,
    pub net_sent_rate: Vec<Option<f64>>,
    pub net_recv_rate: Vec<Option<f64>>,
}

/// Per-second rate of a monotonically increasing counter.
///
/// `None` when either value is missing, no time elapsed or the counter went
/// backwards.
pub fn counter_rate(
    previous: Option<f64>,
    current: Option<f64>,
    elapsed_secs: f64,
) -> Option<f64> {
    let (previous, current) = (previous?, current?);
    if elapsed_secs <= 0.0 || current < previous {
        return None;
    }
    let rate = (current - previous) / elapsed_secs;
    rate.is_finite().then_some(rate)
}

fn rates(
    items: &[CompactSample],
    field: impl Fn(&CompactSystem) -> Option<f64>,
) -> Vec<Option<f64>> {
    let mut rates = Vec::with_capacity(items.len());
    if !items.is_empty() {
        rates.push(None);
    }
    for pair in items.windows(2) {
        rates.push(counter_rate(
            field(&pair[0].system),
            field(&pair[1].system),
            pair[1].timestamp - pair[0].timestamp,
        ));
    }
    rates
}

/// Builds chart series; counters become bytes-per-second rates.
pub fn build_series(items: &[CompactSample]) -> Series {
    Series {
        timestamps: items.iter().map(|item| item.timestamp).collect(),
        cpu_percent: items.iter().map(|item| item.system.cpu_percent).collect(),
        mem_percent: items.iter().map(|item| item.system.mem_percent).collect(),
        disk_percent: items.iter().map(|item| item.system.disk_percent).collect(),
        disk_read_rate: rates(items, |system| system.disk_read_bytes),
        disk_write_rate: rates(items, |system| system.disk_write_bytes),
        net_sent_rate: rates(items, |system| system.net_sent_bytes),
        net_recv_rate: rates(items, |system| system.net_recv_bytes),
    }
}

/// Extremes of one series; both `None` when it has no values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMax {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl MinMax {
    fn of(values: &[Option<f64>]) -> Self {
        values.iter().flatten().fold(Self::default(), |acc, value| Self {
            min: Some(acc.min.map_or(*value, |min| min.min(*value))),
            max: Some(acc.max.map_or(*value, |max| max.max(*value))),
        })
    }
}

/// Min/max of every series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesStats {
    pub cpu_percent: MinMax,
    pub mem_percent: MinMax,
    pub disk_percent: MinMax,
    pub disk_read_rate: MinMax,
    pub disk_write_rate: MinMax,
    pub net_sent_rate: MinMax,
    pub net_recv_rate: MinMax,
}

/// Min/max over `items`, computed before any downsampling.
pub fn compute_stats(items: &[CompactSample]) -> SeriesStats {
    let series = build_series(items);
    SeriesStats {
        cpu_percent: MinMax::of(&series.cpu_percent),
        mem_percent: MinMax::of(&series.mem_percent),
        disk_percent: MinMax::of(&series.disk_percent),
        disk_read_rate: MinMax::of(&series.disk_read_rate),
        disk_write_rate: MinMax::of(&series.disk_write_rate),
        net_sent_rate: MinMax::of(&series.net_sent_rate),
        net_recv_rate: MinMax::of(&series.net_recv_rate),
    }
}

/// Result of [`query`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub since: Option<f64>,
    pub truncated: bool,
    pub total: usize,
    pub points: Vec<CompactSample>,
    pub series: Series,
    pub stats: SeriesStats,
}

/// Reads, summarises and downsamples the history in `dir`.
pub fn query(dir: &Path, query: &HistoryQuery) -> HistoryResponse {
    let read = read_history(dir, query);
    let samples = compact(&read.items);
    let stats = compute_stats(&samples);
    let total = samples.len();
    let points = downsample(samples, query.bucket_seconds, query.max_points);
    HistoryResponse {
        since: read.since,
        truncated: read.truncated,
        total,
        series: build_series(&points),
        points,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_segment(dir: &Path, name: &str, timestamps: &[f64]) {
        let body: String = timestamps
            .iter()
            .map(|ts| format!("{}\n", json!({ "timestamp": ts })))
            .collect();
        fs::write(dir.join(name), body).unwrap();
    }

    fn timestamps(items: &[Value]) -> Vec<f64> {
        items.iter().filter_map(record_timestamp).collect()
    }

    fn sample(timestamp: f64) -> CompactSample {
        CompactSample {
            timestamp,
            ..CompactSample::default()
        }
    }

    fn full(limit: usize) -> HistoryQuery {
        HistoryQuery {
            full: true,
            limit,
            ..HistoryQuery::default()
        }
    }

    #[test]
    fn reads_ascending_across_segments() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), "metrics-100.jsonl", &[3.0, 1.0, 2.0]);
        write_segment(dir.path(), "metrics-200.jsonl", &[5.0, 4.0]);
        fs::write(dir.path().join("notes.txt"), "{\"timestamp\": 9}\n").unwrap();

        let read = read_history(dir.path(), &full(0));
        assert_eq!(timestamps(&read.items), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(!read.truncated);
        assert_eq!(read.since, None);
    }

    #[test]
    fn limit_keeps_newest_and_flags_truncation() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), "metrics-100.jsonl", &[1.0, 2.0, 3.0]);
        write_segment(dir.path(), "metrics-200.jsonl", &[4.0, 5.0]);

        let read = read_history(dir.path(), &full(3));
        assert_eq!(timestamps(&read.items), vec![3.0, 4.0, 5.0]);
        assert!(read.truncated);

        let exact = read_history(dir.path(), &full(5));
        assert_eq!(exact.items.len(), 5);
        assert!(!exact.truncated);
    }

    #[test]
    fn limit_of_one_returns_latest_record() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), "metrics-100.jsonl", &[1.0, 2.0]);
        write_segment(dir.path(), "metrics-200.jsonl", &[3.0]);

        let read = read_history(dir.path(), &full(1));
        assert_eq!(timestamps(&read.items), vec![3.0]);
        assert!(read.truncated);
    }

    #[test]
    fn future_since_returns_nothing() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), "metrics-100.jsonl", &[1.0, 2.0, 3.0]);

        let query = HistoryQuery {
            since: Some(unix_timestamp() + 3600.0),
            ..full(1)
        };
        let read = read_history(dir.path(), &query);
        assert!(read.items.is_empty());
        assert!(!read.truncated);
    }

    #[test]
    fn invalid_utf8_line_only_drops_itself() {
        let dir = tempdir().unwrap();
        let mut body = b"{\"timestamp\":1}\n".to_vec();
        body.extend_from_slice(b"\xff\xfe garbage\n");
        body.extend_from_slice(b"{\"timestamp\":2}\n");
        fs::write(dir.path().join("metrics-100.jsonl"), body).unwrap();

        let read = read_history(dir.path(), &full(0));
        assert_eq!(timestamps(&read.items), vec![1.0, 2.0]);
        assert!(!read.truncated);
    }

    #[test]
    fn since_filters_by_embedded_timestamp() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), "metrics-100.jsonl", &[10.0, 50.0]);
        write_segment(dir.path(), "metrics-200.jsonl", &[20.0, 60.0]);

        let query = HistoryQuery {
            since: Some(40.0),
            ..full(0)
        };
        let read = read_history(dir.path(), &query);
        assert_eq!(timestamps(&read.items), vec![50.0, 60.0]);
        assert_eq!(read.since, Some(40.0));
    }

    #[test]
    fn default_window_excludes_old_records() {
        let dir = tempdir().unwrap();
        let now = unix_timestamp();
        write_segment(dir.path(), "metrics-1.jsonl", &[now - 7200.0, now - 60.0]);

        let query = HistoryQuery {
            default_hours: 1.0,
            ..HistoryQuery::default()
        };
        let read = read_history(dir.path(), &query);
        assert_eq!(read.items.len(), 1);
        assert!(read.since.is_some());
    }

    #[test]
    fn malformed_lines_and_missing_timestamps_are_skipped() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("metrics-1.jsonl"),
            "not json\n{\"timestamp\": \"soon\"}\n{\"system\": {}}\n\n{\"timestamp\": 7}\n",
        )
        .unwrap();

        let read = read_history(dir.path(), &full(0));
        assert_eq!(timestamps(&read.items), vec![7.0]);
    }

    #[test]
    fn missing_directory_reads_nothing() {
        let dir = tempdir().unwrap();
        let read = read_history(&dir.path().join("absent"), &full(0));
        assert!(read.items.is_empty());
    }

    #[test]
    fn bucketing_keeps_last_per_bucket() {
        let items: Vec<CompactSample> =
            [0.0, 5.0, 9.0, 10.0, 25.0].into_iter().map(sample).collect();
        let reduced = downsample(items, Some(10), None);
        let kept: Vec<f64> = reduced.iter().map(|item| item.timestamp).collect();
        assert_eq!(kept, vec![9.0, 10.0, 25.0]);
    }

    #[test]
    fn stride_always_keeps_the_last_item() {
        let items: Vec<CompactSample> = (0..10).map(|i| sample(i as f64)).collect();
        let reduced = downsample(items, None, Some(4));
        let kept: Vec<f64> = reduced.iter().map(|item| item.timestamp).collect();
        assert_eq!(kept, vec![0.0, 3.0, 6.0, 9.0]);

        let items: Vec<CompactSample> = (0..11).map(|i| sample(i as f64)).collect();
        let reduced = downsample(items, None, Some(4));
        let kept: Vec<f64> = reduced.iter().map(|item| item.timestamp).collect();
        assert_eq!(kept, vec![0.0, 3.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn downsample_is_a_no_op_below_the_cap() {
        let items: Vec<CompactSample> = (0..3).map(|i| sample(i as f64)).collect();
        assert_eq!(downsample(items.clone(), None, Some(10)), items);
        assert_eq!(downsample(items.clone(), Some(0), Some(0)), items);
    }

    #[test]
    fn rates_reject_resets_and_stalled_clocks() {
        let items: Vec<CompactSample> = [(0.0, 100.0), (1.0, 80.0), (2.0, 120.0), (2.0, 130.0)]
            .into_iter()
            .map(|(ts, bytes)| CompactSample {
                timestamp: ts,
                system: CompactSystem {
                    disk_read_bytes: Some(bytes),
                    ..CompactSystem::default()
                },
                ..CompactSample::default()
            })
            .collect();

        let series = build_series(&items);
        assert_eq!(series.disk_read_rate, vec![None, None, Some(40.0), None]);
        assert_eq!(series.net_sent_rate, vec![None; 4]);
        assert_eq!(series.timestamps.len(), 4);
    }

    #[test]
    fn compact_projects_snapshot_fields() {
        let record = json!({
            "timestamp": 12.5,
            "system": {
                "cpuPercent": 40.0,
                "memory": {"total": 10, "used": 5, "percent": 50.0},
                "disk": {"total": 10, "used": 1, "percent": 10.0},
                "diskIo": {"readBytes": 100, "writeBytes": 200},
                "netIo": {"bytesSent": 1, "bytesRecv": 2, "packetsSent": 0, "packetsRecv": 0}
            },
            "managedProcesses": [
                {"name": "zurg", "pid": 7, "cpuPercent": 1.5, "memoryRss": 2048,
                 "ioCounters": {"readBytes": 3, "writeBytes": 4}}
            ],
            "externalProcesses": [{"name": "bash", "pid": 9}]
        });

        let compacted = compact(&[record, json!({"system": {}})]);
        assert_eq!(compacted.len(), 1);
        let sample = &compacted[0];
        assert_eq!(sample.system.mem_percent, Some(50.0));
        assert_eq!(sample.system.disk_write_bytes, Some(200.0));
        assert_eq!(sample.system.net_recv_bytes, Some(2.0));
        assert_eq!(sample.managed[0].read_bytes, Some(3));
        assert_eq!(sample.managed[0].memory_rss, Some(2048));
        assert_eq!(sample.external[0].cpu_percent, None);
    }

    #[test]
    fn stats_cover_the_full_set() {
        let items: Vec<CompactSample> = [5.0, 90.0, 20.0]
            .into_iter()
            .enumerate()
            .map(|(i, cpu)| CompactSample {
                timestamp: i as f64,
                system: CompactSystem {
                    cpu_percent: Some(cpu),
                    ..CompactSystem::default()
                },
                ..CompactSample::default()
            })
            .collect();
        let stats = compute_stats(&items);
        assert_eq!(stats.cpu_percent, MinMax { min: Some(5.0), max: Some(90.0) });
        assert_eq!(stats.mem_percent, MinMax::default());
    }

    #[test]
    fn query_reports_stats_before_downsampling() {
        let dir = tempdir().unwrap();
        let body: String = (0..10)
            .map(|i| {
                let cpu = if i == 4 { 99.0 } else { 1.0 };
                format!("{}\n", json!({"timestamp": i as f64, "system": {"cpuPercent": cpu}}))
            })
            .collect();
        fs::write(dir.path().join("metrics-1.jsonl"), body).unwrap();

        let response = query(
            dir.path(),
            &HistoryQuery {
                max_points: Some(3),
                ..full(0)
            },
        );
        assert_eq!(response.total, 10);
        assert_eq!(response.stats.cpu_percent.max, Some(99.0));
        assert!(response.points.len() <= 4);
        assert_eq!(response.points.last().map(|p| p.timestamp), Some(9.0));
        assert_eq!(response.series.timestamps.len(), response.points.len());
    }
}
