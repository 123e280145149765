//! Health classification for managed processes.
//!
//! Checks run from cheapest to most expensive and stop at the first failure:
//! reported status, pid existence, pid liveness, then TCP reachability of the
//! configured ports.
use nix::{errno::Errno, sys::signal, unistd::Pid};
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};
use tracing::debug;

#[cfg(target_os = "linux")]
use std::{fs, path::PathBuf};

use crate::config::ConfigSource;
use crate::constants::{
    DEFAULT_PROBE_HOST, REASON_IDLE, REASON_NOT_HEALTHY, REASON_NOT_INSPECTABLE,
    REASON_NOT_RUNNING, REASON_PID_NOT_RUNNING,
};
use crate::status::ProcessStatus;

/// What the OS reports about a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    /// No such process.
    Missing,
    /// Process exists and is alive.
    Running,
    /// Process exists but is a zombie or otherwise not running.
    NotRunning,
    /// Process exists but could not be described (permissions, exit race).
    Inaccessible,
}

/// Inspects OS processes on behalf of the health checker.
pub trait ProcessProbe: Send + Sync {
    fn inspect(&self, pid: u32) -> PidState;
}

/// [`ProcessProbe`] backed by signal 0 and `/proc/<pid>/stat`.
#[derive(Debug, Clone)]
pub struct OsProbe {
    #[cfg(target_os = "linux")]
    proc_root: PathBuf,
}

impl Default for OsProbe {
    fn default() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            proc_root: PathBuf::from(crate::constants::DEFAULT_PROC_ROOT),
        }
    }
}

impl OsProbe {
    fn exists(pid: u32) -> Option<bool> {
        let Some(raw) = i32::try_from(pid).ok().filter(|raw| *raw > 0) else {
            return Some(false);
        };
        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => Some(true),
            Err(Errno::ESRCH) => Some(false),
            Err(Errno::EPERM) => Some(true),
            Err(err) => {
                debug!("signal probe for pid {pid} failed: {err}");
                None
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn read_proc_state(&self, pid: u32) -> Option<char> {
        let stat = self.proc_root.join(pid.to_string()).join("stat");
        let contents = fs::read_to_string(stat).ok()?;
        // The command name is wrapped in parentheses and may contain spaces.
        let after_comm = &contents[contents.rfind(')')? + 1..];
        after_comm.split_whitespace().next()?.chars().next()
    }
}

impl ProcessProbe for OsProbe {
    fn inspect(&self, pid: u32) -> PidState {
        match Self::exists(pid) {
            Some(true) => {}
            Some(false) => return PidState::Missing,
            None => return PidState::Inaccessible,
        }

        #[cfg(target_os = "linux")]
        {
            match self.read_proc_state(pid) {
                Some('Z' | 'X' | 'x') => PidState::NotRunning,
                Some(_) => PidState::Running,
                None => PidState::Inaccessible,
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            use sysinfo::{ProcessStatus as SysStatus, ProcessesToUpdate, System};

            let target = sysinfo::Pid::from_u32(pid);
            let mut system = System::new();
            system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
            match system.process(target).map(|process| process.status()) {
                Some(SysStatus::Zombie | SysStatus::Dead) => PidState::NotRunning,
                Some(_) => PidState::Running,
                None => PidState::Inaccessible,
            }
        }
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthVerdict {
    pub healthy: bool,
    pub reason: Option<String>,
}

impl HealthVerdict {
    fn healthy() -> Self {
        Self {
            healthy: true,
            reason: None,
        }
    }

    fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

/// Maps wildcard bind addresses to loopback so they can be probed.
pub fn probe_host(host: Option<&str>) -> String {
    match host.map(str::trim) {
        None | Some("") | Some("0.0.0.0") | Some("::") | Some("[::]") => {
            DEFAULT_PROBE_HOST.to_string()
        }
        Some(host) => host.to_string(),
    }
}

/// Attempts a TCP connection to `host:port`.
///
/// Name resolution and every connection attempt share a single `timeout`.
pub fn port_responds(host: &str, port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let Some(addresses) = resolve(host, port, timeout) else {
        return false;
    };
    for address in addresses {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("probe of {host}:{port} ran out of time");
            return false;
        }
        if TcpStream::connect_timeout(&address, remaining).is_ok() {
            return true;
        }
    }
    false
}

fn resolve(host: &str, port: u16, timeout: Duration) -> Option<Vec<SocketAddr>> {
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        return Some(vec![SocketAddr::new(ip, port)]);
    }

    // Lookups cannot be cancelled; a stuck resolver thread is abandoned.
    let (tx, rx) = mpsc::channel();
    let target = (host.to_string(), port);
    thread::spawn(move || {
        let _ = tx.send(target.to_socket_addrs().map(Iterator::collect::<Vec<_>>));
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(addresses)) => Some(addresses),
        Ok(Err(err)) => {
            debug!("failed to resolve {host}:{port}: {err}");
            None
        }
        Err(_) => {
            debug!("resolving {host}:{port} timed out");
            None
        }
    }
}

/// Derives healthy/unhealthy verdicts for managed processes.
pub struct HealthChecker {
    config: Arc<dyn ConfigSource>,
    probe: Box<dyn ProcessProbe>,
    timeout: Duration,
}

impl HealthChecker {
    /// Creates a checker inspecting real OS processes.
    pub fn new(config: Arc<dyn ConfigSource>, timeout: Duration) -> Self {
        Self::with_probe(config, Box::new(OsProbe::default()), timeout)
    }

    pub fn with_probe(
        config: Arc<dyn ConfigSource>,
        probe: Box<dyn ProcessProbe>,
        timeout: Duration,
    ) -> Self {
        Self {
            config,
            probe,
            timeout,
        }
    }

    /// Classifies `process_name` given its reported status and pid.
    pub fn check(
        &self,
        process_name: &str,
        status: ProcessStatus,
        pid: Option<u32>,
    ) -> HealthVerdict {
        if status == ProcessStatus::Idle {
            return HealthVerdict {
                healthy: true,
                reason: Some(REASON_IDLE.to_string()),
            };
        }
        if status != ProcessStatus::Running || process_name.trim().is_empty() {
            return HealthVerdict::unhealthy(REASON_NOT_RUNNING);
        }

        let Some(pid) = pid else {
            return HealthVerdict::unhealthy(REASON_PID_NOT_RUNNING);
        };
        match self.probe.inspect(pid) {
            PidState::Missing => return HealthVerdict::unhealthy(REASON_PID_NOT_RUNNING),
            PidState::NotRunning => return HealthVerdict::unhealthy(REASON_NOT_HEALTHY),
            PidState::Inaccessible => {
                return HealthVerdict::unhealthy(REASON_NOT_INSPECTABLE);
            }
            PidState::Running => {}
        }

        let Some(process) = self.config.process_config(process_name) else {
            return HealthVerdict::healthy();
        };
        let host = probe_host(process.host.as_deref());
        for port in process.ports() {
            if !port_responds(&host, port, self.timeout) {
                debug!("health probe for '{process_name}' failed on {host}:{port}");
                return HealthVerdict::unhealthy(format!("Port {host}:{port} not responding"));
            }
        }

        HealthVerdict::healthy()
    }
}
