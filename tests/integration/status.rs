#[path = "common/mod.rs"]
mod common;

use common::{SleepingChild, config_in, write_status};
use procpulse::{
    status::ProcessStatus,
    supervisor::StaticSupervisor,
    telemetry::Telemetry,
};
use serde_json::json;
use std::{net::TcpListener, sync::Arc};
use tempfile::tempdir;

#[test]
fn status_document_entries_resolve_by_normalized_name() {
    let temp = tempdir().expect("create tempdir");
    write_status(&temp.path().join("status.json"), &json!({"DumbAPI": 1234}));
    let telemetry = Telemetry::standalone(config_in(temp.path(), "{}"));

    let details = telemetry.status("dumb api", false);
    assert_eq!(details.status, ProcessStatus::Running);
    assert_eq!(details.pid, Some(1234));
    assert_eq!(details.process_name, "DumbAPI");
}

#[test]
fn missing_status_file_is_created_under_configured_path() {
    let temp = tempdir().expect("create tempdir");
    let telemetry =
        Telemetry::standalone(config_in(temp.path(), "status_file: run/state/status.json\n"));

    assert!(telemetry.status_snapshot(false).is_empty());
    assert_eq!(
        std::fs::read_to_string(temp.path().join("run/state/status.json")).unwrap(),
        "{}"
    );
    assert_eq!(telemetry.status("zurg", false).status, ProcessStatus::Stopped);
}

#[test]
fn status_changes_are_picked_up_on_next_query() {
    let temp = tempdir().expect("create tempdir");
    let path = temp.path().join("status.json");
    write_status(&path, &json!({"Zurg": 10}));
    let telemetry = Telemetry::standalone(config_in(temp.path(), "{}"));
    assert!(!telemetry.status_store().is_running("riven"));

    write_status(&path, &json!({"Zurg": 10, "Riven Backend": 11}));
    assert!(telemetry.status_store().is_running("riven backend"));
    let names: Vec<String> = telemetry
        .status_snapshot(false)
        .into_iter()
        .map(|details| details.process_name)
        .collect();
    assert_eq!(names, vec!["Zurg", "Riven Backend"]);
}

#[test]
fn live_process_with_reachable_port_is_healthy() {
    let temp = tempdir().expect("create tempdir");
    let child = SleepingChild::spawn();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().unwrap().port();

    let yaml = format!(
        r#"
health:
  probe_timeout_ms: 500
services:
  sleeper:
    instances:
      Default:
        process_name: Sleeper
        host: "0.0.0.0"
        port: {port}
"#
    );
    write_status(&temp.path().join("status.json"), &json!({"Sleeper": child.pid()}));
    let telemetry = Telemetry::standalone(config_in(temp.path(), &yaml));

    let details = telemetry.status("sleeper", true);
    assert_eq!(details.healthy, Some(true));
    assert_eq!(details.health_reason, None);

    drop(listener);
    let details = telemetry.status("sleeper", true);
    assert_eq!(details.healthy, Some(false));
    assert_eq!(
        details.health_reason,
        Some(format!("Port 127.0.0.1:{port} not responding"))
    );
}

#[test]
fn exited_process_is_reported_as_not_running() {
    let temp = tempdir().expect("create tempdir");
    let child = SleepingChild::spawn();
    let pid = child.pid();
    drop(child);

    let supervisor = Arc::new(StaticSupervisor::new());
    supervisor.insert(pid, "Decypharr");
    supervisor.set_restart_stats("Decypharr", json!({"restarts": 4, "lastExit": 137}));
    write_status(&temp.path().join("status.json"), &json!({"Decypharr": pid}));
    let telemetry = Telemetry::new(config_in(temp.path(), "{}"), supervisor);

    let details = telemetry.status("decypharr", true);
    assert_eq!(details.status, ProcessStatus::Running);
    assert_eq!(details.healthy, Some(false));
    assert_eq!(details.health_reason.as_deref(), Some("Process PID not running"));
    assert_eq!(details.restart, Some(json!({"restarts": 4, "lastExit": 137})));
}

#[test]
fn stopped_process_skips_probing() {
    let temp = tempdir().expect("create tempdir");
    write_status(&temp.path().join("status.json"), &json!({}));
    let telemetry = Telemetry::standalone(config_in(temp.path(), "{}"));

    let details = telemetry.status("zurg", true);
    assert_eq!(details.status, ProcessStatus::Stopped);
    assert_eq!(details.healthy, Some(false));
    assert_eq!(details.health_reason.as_deref(), Some("Process not running"));
}
