#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::{history_record, write_config, write_segment, write_status};
use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use tempfile::tempdir;

fn pulse() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("pulse"))
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn status_prints_every_entry_as_json() {
    let temp = tempdir().expect("create tempdir");
    let config = write_config(temp.path(), "metrics:\n  scope: host\n");
    write_status(&temp.path().join("status.json"), &json!({"Zurg": 5, "DumbAPI": 1234}));

    let output = pulse()
        .arg("status")
        .arg("--config")
        .arg(&config)
        .output()
        .expect("run pulse status");
    assert!(output.status.success());

    let value = stdout_json(&output);
    let entries = value.as_array().expect("array of entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["processName"], "Zurg");
    assert_eq!(entries[1]["status"], "running");
}

#[test]
fn status_for_one_name_normalizes_the_lookup() {
    let temp = tempdir().expect("create tempdir");
    let config = write_config(temp.path(), "{}\n");
    write_status(&temp.path().join("status.json"), &json!({"DumbAPI": 1234}));

    let output = pulse()
        .args(["status", "dumb api", "-c"])
        .arg(&config)
        .output()
        .expect("run pulse status");
    assert!(output.status.success());

    let value = stdout_json(&output);
    assert_eq!(value["status"], "running");
    assert_eq!(value["pid"], 1234);
    assert!(value.get("healthy").is_none());
}

#[test]
fn history_reports_totals_from_segments() {
    let temp = tempdir().expect("create tempdir");
    let config = write_config(temp.path(), "history_dir: samples\n");
    write_segment(
        &temp.path().join("samples"),
        "metrics-1.jsonl",
        &[
            history_record(10.0, 1.0, 0),
            history_record(20.0, 2.0, 500),
            history_record(30.0, 3.0, 1500),
        ],
    );

    let output = pulse()
        .args(["history", "--full", "--limit", "2", "-c"])
        .arg(&config)
        .output()
        .expect("run pulse history");
    assert!(output.status.success());

    let value = stdout_json(&output);
    assert_eq!(value["total"], 2);
    assert_eq!(value["truncated"], true);
    assert_eq!(value["series"]["timestamps"], json!([20.0, 30.0]));
    assert_eq!(value["series"]["diskReadRate"], json!([null, 100.0]));
}

#[test]
fn metrics_honours_the_external_limit() {
    let temp = tempdir().expect("create tempdir");
    let config = write_config(temp.path(), "metrics:\n  scope: host\n");

    let output = pulse()
        .args(["metrics", "--external", "2", "-c"])
        .arg(&config)
        .output()
        .expect("run pulse metrics");
    assert!(output.status.success());

    let value = stdout_json(&output);
    assert_eq!(value["system"]["scope"], "host");
    assert!(value["system"]["cpuCount"].as_f64().unwrap() >= 1.0);
    assert!(value["externalProcesses"].as_array().unwrap().len() <= 2);
    assert!(value["managedProcesses"].as_array().unwrap().is_empty());
}

#[test]
fn watch_prints_payloads_and_records_history() {
    let temp = tempdir().expect("create tempdir");
    let config = write_config(
        temp.path(),
        "history_dir: samples\nmetrics:\n  scope: host\n  external_limit: 1\n",
    );
    write_status(&temp.path().join("status.json"), &json!({"Zurg": 5}));

    let output = pulse()
        .args(["watch", "--interval", "0.5", "--count", "2", "--record", "-c"])
        .arg(&config)
        .timeout(std::time::Duration::from_secs(60))
        .output()
        .expect("run pulse watch");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let payloads: Vec<Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("payload is JSON"))
        .collect();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0]["status"][0]["processName"], "Zurg");
    assert!(payloads[1]["metrics"]["timestamp"].as_f64().is_some());

    let recorded: usize = fs::read_dir(temp.path().join("samples"))
        .unwrap()
        .flatten()
        .map(|entry| fs::read_to_string(entry.path()).unwrap().lines().count())
        .sum();
    assert!(recorded >= 2);
}

#[test]
fn invalid_config_is_reported() {
    let temp = tempdir().expect("create tempdir");
    let config = write_config(temp.path(), "metrics: [unclosed\n");

    pulse()
        .arg("status")
        .arg("-c")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid YAML"));
}

#[test]
fn unknown_log_level_is_rejected() {
    pulse()
        .args(["--log-level", "9", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported log level"));
}
