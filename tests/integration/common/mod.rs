#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use procpulse::config::FileConfig;
use serde_json::{Value, json};

/// Writes `pulse.yaml` into `dir` and returns its path.
pub fn write_config(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("pulse.yaml");
    fs::write(&path, yaml).expect("write config");
    path
}

/// Parses `yaml` as a configuration rooted at `dir`.
pub fn config_in(dir: &Path, yaml: &str) -> Arc<FileConfig> {
    Arc::new(FileConfig::from_yaml(yaml, Some(dir.to_path_buf())).expect("parse config"))
}

/// Writes the status document `{ name: pid }` at `path`.
pub fn write_status(path: &Path, document: &Value) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create status dir");
    }
    fs::write(path, document.to_string()).expect("write status file");
}

/// Minimal metrics record as found in history segments.
pub fn history_record(timestamp: f64, cpu: f64, read_bytes: u64) -> Value {
    json!({
        "timestamp": timestamp,
        "system": {
            "cpuPercent": cpu,
            "memory": {"total": 100, "used": 40, "percent": 40.0},
            "diskIo": {"readBytes": read_bytes, "writeBytes": 0},
            "netIo": {"bytesSent": 0, "bytesRecv": 0, "packetsSent": 0, "packetsRecv": 0},
            "scope": "host"
        },
        "managedProcesses": [],
        "externalProcesses": []
    })
}

/// Writes `records` as one JSON line each into `dir/name`.
pub fn write_segment(dir: &Path, name: &str, records: &[Value]) {
    fs::create_dir_all(dir).expect("create history dir");
    let body: String = records.iter().map(|record| format!("{record}\n")).collect();
    fs::write(dir.join(name), body).expect("write segment");
}

/// A `sleep` child killed when dropped.
pub struct SleepingChild(Child);

impl SleepingChild {
    pub fn spawn() -> Self {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        Self(child)
    }

    pub fn pid(&self) -> u32 {
        self.0.id()
    }
}

impl Drop for SleepingChild {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}
