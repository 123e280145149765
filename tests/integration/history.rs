#[path = "common/mod.rs"]
mod common;

use common::{config_in, history_record, write_segment};
use procpulse::{
    history::{self, HistoryQuery, SegmentWriter, read_history},
    metrics::unix_timestamp,
    telemetry::Telemetry,
};
use std::fs;
use tempfile::tempdir;

fn full_query() -> HistoryQuery {
    HistoryQuery {
        full: true,
        limit: 0,
        ..HistoryQuery::default()
    }
}

#[test]
fn out_of_order_segments_are_returned_by_timestamp() {
    let temp = tempdir().expect("create tempdir");
    let dir = temp.path().join("history");
    write_segment(
        &dir,
        "metrics-1700000000.jsonl",
        &[history_record(30.0, 1.0, 0), history_record(10.0, 1.0, 0)],
    );
    write_segment(
        &dir,
        "metrics-1700000100.jsonl",
        &[history_record(20.0, 1.0, 0), history_record(40.0, 1.0, 0)],
    );

    let read = read_history(&dir, &full_query());
    let timestamps: Vec<f64> = read
        .items
        .iter()
        .map(|item| item["timestamp"].as_f64().unwrap())
        .collect();
    assert_eq!(timestamps, vec![10.0, 20.0, 30.0, 40.0]);
}

#[test]
fn query_computes_rates_stats_and_keeps_the_latest_point() {
    let temp = tempdir().expect("create tempdir");
    let dir = temp.path().join("history");
    let records: Vec<_> = (0..20)
        .map(|i| {
            // Counter resets at i == 10.
            let bytes = if i < 10 { i * 100 } else { (i - 10) * 100 };
            history_record(1000.0 + i as f64, i as f64, bytes)
        })
        .collect();
    write_segment(&dir, "metrics-1.jsonl", &records);

    let response = history::query(
        &dir,
        &HistoryQuery {
            max_points: Some(6),
            ..full_query()
        },
    );

    assert_eq!(response.total, 20);
    assert_eq!(response.stats.cpu_percent.min, Some(0.0));
    assert_eq!(response.stats.cpu_percent.max, Some(19.0));
    assert_eq!(response.stats.disk_read_rate.max, Some(100.0));
    assert_eq!(response.points.last().map(|point| point.timestamp), Some(1019.0));
    assert!(response.points.len() <= 7);
    assert!(
        response
            .series
            .disk_read_rate
            .iter()
            .flatten()
            .all(|rate| *rate >= 0.0 && rate.is_finite())
    );
}

#[test]
fn bucketed_query_keeps_last_sample_per_bucket() {
    let temp = tempdir().expect("create tempdir");
    let dir = temp.path().join("history");
    write_segment(
        &dir,
        "metrics-1.jsonl",
        &[
            history_record(60.0, 1.0, 0),
            history_record(90.0, 2.0, 0),
            history_record(119.0, 3.0, 0),
            history_record(120.0, 4.0, 0),
        ],
    );

    let response = history::query(
        &dir,
        &HistoryQuery {
            bucket_seconds: Some(60),
            ..full_query()
        },
    );
    assert_eq!(response.series.timestamps, vec![119.0, 120.0]);
    assert_eq!(response.series.cpu_percent, vec![Some(3.0), Some(4.0)]);
}

#[test]
fn writer_output_round_trips_through_telemetry() {
    let temp = tempdir().expect("create tempdir");
    let telemetry = Telemetry::standalone(config_in(
        temp.path(),
        "history_dir: samples\nmetrics:\n  scope: host\n",
    ));

    let mut writer = telemetry.history_writer().expect("open writer");
    let now = unix_timestamp();
    writer.append(&history_record(now - 30.0, 5.0, 100)).unwrap();
    writer.append(&history_record(now - 20.0, 6.0, 300)).unwrap();
    writer.append(&history_record(now - 3.0 * 24.0 * 3600.0, 7.0, 0)).unwrap();

    let response = telemetry.history(&telemetry.history_query());
    assert_eq!(response.total, 2);
    assert_eq!(response.series.disk_read_rate, vec![None, Some(20.0)]);
    assert!(response.since.is_some());

    let everything = telemetry.history(&HistoryQuery {
        full: true,
        ..telemetry.history_query()
    });
    assert_eq!(everything.total, 3);
}

#[test]
fn reader_never_modifies_segments() {
    let temp = tempdir().expect("create tempdir");
    let dir = temp.path().join("history");
    write_segment(&dir, "metrics-5.jsonl", &[history_record(1.0, 1.0, 0)]);
    fs::write(dir.join("metrics-6.jsonl"), "garbage\n").unwrap();
    let before = fs::read(dir.join("metrics-6.jsonl")).unwrap();

    let read = read_history(&dir, &full_query());
    assert_eq!(read.items.len(), 1);
    assert_eq!(fs::read(dir.join("metrics-6.jsonl")).unwrap(), before);

    let mut writer = SegmentWriter::new(&dir, 1024, 1024 * 1024).unwrap();
    writer.append(&history_record(2.0, 1.0, 0)).unwrap();
    assert_eq!(read_history(&dir, &full_query()).items.len(), 2);
}
