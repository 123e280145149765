#[path = "common/mod.rs"]
mod common;

use common::{config_in, wait_until, write_status};
use procpulse::{
    error::ObserverError,
    history::list_segments,
    publisher::{
        ChannelObserver, Observer, ObserverSet, PublisherOptions, SnapshotPayload,
        SnapshotPublisher,
    },
    telemetry::Telemetry,
};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tempfile::tempdir;

struct ClosedObserver {
    closed: AtomicBool,
}

impl Observer for ClosedObserver {
    fn send(&self, _payload: &str) -> Result<(), ObserverError> {
        Err(ObserverError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn telemetry(dir: &std::path::Path) -> Arc<Telemetry> {
    write_status(&dir.join("status.json"), &json!({"Zurg": 5, "Riven": 6}));
    Arc::new(Telemetry::standalone(config_in(
        dir,
        "history_dir: history\nmetrics:\n  scope: host\n",
    )))
}

#[test]
fn observers_receive_status_and_metrics_payloads() {
    let temp = tempdir().expect("create tempdir");
    let observers = Arc::new(ObserverSet::new());
    let (observer, receiver) = ChannelObserver::new();
    observers.connect(Arc::new(observer));

    let publisher = SnapshotPublisher::spawn_with_observers(
        telemetry(temp.path()),
        Arc::clone(&observers),
        Duration::from_millis(500),
        PublisherOptions {
            external_limit: 3,
            ..PublisherOptions::default()
        },
    );

    let text = receiver
        .recv_timeout(Duration::from_secs(30))
        .expect("first payload");
    let payload: SnapshotPayload = serde_json::from_str(&text).expect("payload parses");
    let names: Vec<_> = payload.status.iter().map(|s| s.process_name.as_str()).collect();
    assert_eq!(names, vec!["Zurg", "Riven"]);
    assert!(payload.status.iter().all(|s| s.healthy.is_none()));
    assert!(payload.metrics.external_processes.len() <= 3);
    assert_eq!(payload.metrics.managed_processes.len(), 2);

    publisher.stop();
    assert!(observers.is_empty());
    while receiver.try_recv().is_ok() {}
    assert!(receiver.recv().is_err());
}

#[test]
fn failed_observers_are_dropped_from_the_set() {
    let temp = tempdir().expect("create tempdir");
    let publisher = SnapshotPublisher::spawn(
        telemetry(temp.path()),
        Duration::from_millis(500),
        PublisherOptions::default(),
    );

    let closed = Arc::new(ClosedObserver {
        closed: AtomicBool::new(false),
    });
    let (healthy, receiver) = ChannelObserver::with_capacity(64);
    publisher.observers().connect(closed.clone());
    publisher.observers().connect(Arc::new(healthy));

    assert!(wait_until(|| closed.closed.load(Ordering::SeqCst)));
    assert_eq!(publisher.observers().len(), 1);
    assert!(receiver.recv_timeout(Duration::from_secs(30)).is_ok());
    drop(publisher);
}

#[test]
fn recorder_appends_snapshots_to_history() {
    let temp = tempdir().expect("create tempdir");
    let telemetry = telemetry(temp.path());
    let recorder = telemetry.history_writer().expect("open writer");

    let publisher = SnapshotPublisher::spawn(
        Arc::clone(&telemetry),
        Duration::from_millis(500),
        PublisherOptions {
            recorder: Some(recorder),
            ..PublisherOptions::default()
        },
    );

    let history_dir = temp.path().join("history");
    assert!(wait_until(|| {
        telemetry
            .history(&procpulse::history::HistoryQuery {
                full: true,
                ..telemetry.history_query()
            })
            .total
            >= 2
    }));
    publisher.stop();
    assert!(!list_segments(&history_dir).is_empty());
}
