//! Point-in-time resource snapshots of the host, the engine's cgroup and the
//! processes running on it.
//!
//! A [`MetricsSampler`] keeps its `sysinfo::System` between calls so process
//! CPU percentages and the cgroup CPU rate are measured over the interval
//! since the previous snapshot.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Instant, SystemTime},
};
use sysinfo::{
    MINIMUM_CPU_UPDATE_INTERVAL, Networks, Pid, ProcessRefreshKind, ProcessesToUpdate, System,
};
use tracing::debug;

use crate::config::{ConfigSource, MetricsScope, MetricsSettings, ProcessConfig};
use crate::supervisor::ProcessSupervisor;

pub mod cgroup;
pub mod procfs;

pub use cgroup::CgroupReader;
pub use procfs::ProcFs;

use procfs::{SocketTable, process_sockets};

/// Current wall clock as fractional unix seconds.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Capacity and usage of a memory pool or filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total: u64,
    pub used: u64,
    pub percent: f64,
}

impl UsageTotals {
    pub fn new(total: u64, used: u64) -> Self {
        Self {
            total,
            used,
            percent: percent(used, total),
        }
    }
}

/// Cumulative block I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskIoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Cumulative network counters summed over all interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetIoCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

/// Machine (or container) wide metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    pub cpu_count: f64,
    pub load_average: [f64; 3],
    pub memory: UsageTotals,
    pub swap: UsageTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<UsageTotals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_io: Option<DiskIoCounters>,
    pub net_io: NetIoCounters,
    pub boot_time: u64,
    pub scope: MetricsScope,
}

/// An established TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub local: String,
    pub remote: String,
}

/// Usage of the filesystem holding a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathUsage {
    pub path: String,
    pub total: u64,
    pub used: u64,
    pub percent: f64,
}

/// Resource usage of one OS process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    pub name: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_vms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_counters: Option<DiskIoCounters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listening_ports: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<ConnectionInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configured_ports: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<PathUsage>>,
}

impl ProcessMetrics {
    fn bare(name: &str, pid: u32) -> Self {
        Self {
            name: name.to_string(),
            pid,
            ..Self::default()
        }
    }
}

/// One sampling pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: f64,
    pub system: SystemMetrics,
    pub managed_processes: Vec<ProcessMetrics>,
    pub external_processes: Vec<ProcessMetrics>,
}

/// Filesystem usage of `path` via statvfs; `None` if the path is gone.
pub fn path_usage(path: &Path) -> Option<PathUsage> {
    let stats = match nix::sys::statvfs::statvfs(path) {
        Ok(stats) => stats,
        Err(err) => {
            debug!("statvfs failed for {}: {err}", path.display());
            return None;
        }
    };
    let fragment = stats.fragment_size() as u64;
    let total = (stats.blocks() as u64).saturating_mul(fragment);
    let free = (stats.blocks_free() as u64).saturating_mul(fragment);
    let available = (stats.blocks_available() as u64).saturating_mul(fragment);
    let used = total.saturating_sub(free);
    Some(PathUsage {
        path: path.display().to_string(),
        total,
        used,
        percent: percent(used, used.saturating_add(available)),
    })
}

/// Mount paths of the configured rclone instances, deduplicated.
fn rclone_mounts(config: &dyn ConfigSource) -> Vec<PathBuf> {
    let instances: Vec<Value> = match config.get("rclone.instances") {
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) => map.into_iter().map(|(_, value)| value).collect(),
        _ => return Vec::new(),
    };
    let mut mounts = Vec::new();
    for instance in instances {
        let (Some(dir), Some(name)) = (
            instance.get("mount_dir").and_then(Value::as_str),
            instance.get("mount_name").and_then(Value::as_str),
        ) else {
            continue;
        };
        let mount = Path::new(dir).join(name);
        if !mounts.contains(&mount) {
            mounts.push(mount);
        }
    }
    mounts
}

/// Paths whose filesystem usage is reported for a managed process.
pub fn disk_paths(process: Option<&ProcessConfig>, mounts: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut push = |path: PathBuf| {
        if !path.as_os_str().is_empty() && !paths.contains(&path) {
            paths.push(path);
        }
    };

    if let Some(process) = process {
        if let Some(dir) = &process.config_dir {
            push(PathBuf::from(dir));
        }
        for file in [&process.config_file, &process.log_file].into_iter().flatten() {
            if let Some(parent) = Path::new(file).parent() {
                push(parent.to_path_buf());
            }
        }
        for value in process.env.values() {
            if Path::new(value).is_absolute() {
                push(PathBuf::from(value));
            }
        }
    }
    for mount in mounts {
        push(mount.clone());
    }
    paths
}

/// Samples system and process metrics.
pub struct MetricsSampler {
    supervisor: Arc<dyn ProcessSupervisor>,
    config: Arc<dyn ConfigSource>,
    settings: MetricsSettings,
    system: System,
    cgroup: CgroupReader,
    procfs: ProcFs,
    last_cgroup_cpu: Option<(u64, Instant)>,
    last_refresh: Option<Instant>,
}

impl MetricsSampler {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        config: Arc<dyn ConfigSource>,
        settings: MetricsSettings,
    ) -> Self {
        let cgroup = CgroupReader::new(&settings.cgroup_root);
        let procfs = ProcFs::new(&settings.proc_root);
        Self {
            supervisor,
            config,
            settings,
            system: System::new(),
            cgroup,
            procfs,
            last_cgroup_cpu: None,
            last_refresh: None,
        }
    }

    /// Scope the next snapshot will be taken in, before any fallback.
    pub fn effective_scope(&self) -> MetricsScope {
        match self.settings.scope {
            MetricsScope::Auto if self.cgroup.has_cpu_accounting() => MetricsScope::Cgroup,
            MetricsScope::Auto => MetricsScope::Host,
            scope => scope,
        }
    }

    /// Takes a snapshot including at most `external_limit` unmanaged
    /// processes, busiest first.
    ///
    /// The first call primes the CPU counters and waits
    /// [`MINIMUM_CPU_UPDATE_INTERVAL`] before measuring. Processes first seen
    /// by this refresh report no CPU percent.
    pub fn snapshot(&mut self, external_limit: usize) -> MetricsSnapshot {
        if self.last_refresh.is_none() {
            self.refresh();
        }
        if let Some(elapsed) = self.last_refresh.map(|at| at.elapsed())
            && elapsed < MINIMUM_CPU_UPDATE_INTERVAL
        {
            thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL - elapsed);
        }
        let baseline: HashSet<u32> = self
            .system
            .processes()
            .keys()
            .map(|pid| pid.as_u32())
            .collect();
        self.refresh();
        let sockets = self.procfs.socket_table();

        let managed = self.supervisor.processes();
        let mounts = rclone_mounts(self.config.as_ref());
        let managed_pids: HashSet<u32> = managed.iter().map(|process| process.pid).collect();

        let managed_processes = managed
            .iter()
            .map(|process| {
                let mut metrics = self
                    .process_metrics(process.pid, &sockets, &baseline)
                    .unwrap_or_else(|| ProcessMetrics::bare(&process.name, process.pid));
                metrics.name = process.name.clone();

                let config = self.config.process_config(&process.name);
                let ports = config.as_ref().map(ProcessConfig::ports).unwrap_or_default();
                if !ports.is_empty() {
                    metrics.configured_ports = Some(ports);
                }
                let disks: Vec<PathUsage> = disk_paths(config.as_ref(), &mounts)
                    .iter()
                    .filter(|path| path.exists())
                    .filter_map(|path| path_usage(path))
                    .collect();
                if !disks.is_empty() {
                    metrics.disks = Some(disks);
                }
                metrics
            })
            .collect();

        let mut external_processes: Vec<ProcessMetrics> = self
            .system
            .processes()
            .keys()
            .map(|pid| pid.as_u32())
            .filter(|pid| !managed_pids.contains(pid))
            .filter_map(|pid| {
                let mut metrics = self.process_metrics(pid, &sockets, &baseline)?;
                metrics.container_id = self.procfs.container_id(pid);
                Some(metrics)
            })
            .collect();
        external_processes.sort_by(|a, b| {
            b.cpu_percent
                .unwrap_or(0.0)
                .total_cmp(&a.cpu_percent.unwrap_or(0.0))
                .then(a.pid.cmp(&b.pid))
        });
        external_processes.truncate(external_limit);

        MetricsSnapshot {
            timestamp: unix_timestamp(),
            system: self.system_metrics(),
            managed_processes,
            external_processes,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cpu()
                .with_memory()
                .with_disk_usage(),
        );
        self.last_refresh = Some(Instant::now());
    }

    fn process_metrics(
        &self,
        pid: u32,
        sockets: &SocketTable,
        baseline: &HashSet<u32>,
    ) -> Option<ProcessMetrics> {
        let process = self.system.process(Pid::from_u32(pid))?;
        let disk = process.disk_usage();
        let mut metrics = ProcessMetrics {
            name: process.name().to_string_lossy().into_owned(),
            pid,
            cpu_percent: baseline
                .contains(&pid)
                .then(|| f64::from(process.cpu_usage())),
            memory_rss: Some(process.memory()),
            memory_vms: Some(process.virtual_memory()),
            num_threads: self.procfs.thread_count(pid),
            io_counters: Some(DiskIoCounters {
                read_bytes: disk.total_read_bytes,
                write_bytes: disk.total_written_bytes,
            }),
            ..ProcessMetrics::default()
        };

        if let Some(inodes) = self.procfs.socket_inodes(pid) {
            let found = process_sockets(sockets, &inodes);
            metrics.listening_ports = Some(found.listening_ports);
            metrics.connections = Some(
                found
                    .established
                    .into_iter()
                    .map(|(local, remote)| ConnectionInfo {
                        local: local.to_string(),
                        remote: remote.to_string(),
                    })
                    .collect(),
            );
        }
        Some(metrics)
    }

    fn system_metrics(&mut self) -> SystemMetrics {
        if self.effective_scope() == MetricsScope::Cgroup {
            if let Some(metrics) = self.cgroup_metrics() {
                return metrics;
            }
            debug!(
                "cgroup accounting unreadable under {}, using host scope",
                self.cgroup.root().display()
            );
        }
        self.host_metrics()
    }

    fn host_metrics(&self) -> SystemMetrics {
        let load = System::load_average();
        SystemMetrics {
            cpu_percent: Some(f64::from(self.system.global_cpu_usage())),
            cpu_count: self.system.cpus().len() as f64,
            load_average: [load.one, load.five, load.fifteen],
            memory: UsageTotals::new(self.system.total_memory(), self.system.used_memory()),
            swap: UsageTotals::new(self.system.total_swap(), self.system.used_swap()),
            disk: root_usage(),
            disk_io: self.procfs.disk_io(),
            net_io: net_io(),
            boot_time: System::boot_time(),
            scope: MetricsScope::Host,
        }
    }

    fn cgroup_metrics(&mut self) -> Option<SystemMetrics> {
        let usage = self.cgroup.cpu_usage_usec();
        let memory_current = self.cgroup.memory_current();
        if usage.is_none() && memory_current.is_none() {
            self.last_cgroup_cpu = None;
            return None;
        }

        let host_cores = self.system.cpus().len() as f64;
        let quota = self.cgroup.cpu_quota().unwrap_or(host_cores);
        let now = Instant::now();
        let cpu_percent = match (usage, self.last_cgroup_cpu) {
            (Some(usage), Some((previous, at))) => cgroup::cpu_rate_percent(
                previous,
                usage,
                now.duration_since(at).as_secs_f64(),
                quota,
            ),
            _ => None,
        };
        self.last_cgroup_cpu = usage.map(|usage| (usage, now));

        let memory = match (memory_current, self.cgroup.memory_max()) {
            (Some(current), Some(max)) => UsageTotals::new(max, current),
            _ => UsageTotals::new(self.system.total_memory(), self.system.used_memory()),
        };
        let load = System::load_average();
        let boot_time = self
            .system
            .process(Pid::from_u32(1))
            .map(|init| init.start_time())
            .filter(|start| *start > 0)
            .unwrap_or_else(System::boot_time);

        Some(SystemMetrics {
            cpu_percent,
            cpu_count: quota,
            load_average: [load.one, load.five, load.fifteen],
            memory,
            swap: UsageTotals::new(self.system.total_swap(), self.system.used_swap()),
            disk: root_usage(),
            disk_io: self.cgroup.io_totals().or_else(|| self.procfs.disk_io()),
            net_io: net_io(),
            boot_time,
            scope: MetricsScope::Cgroup,
        })
    }
}

fn root_usage() -> Option<UsageTotals> {
    path_usage(Path::new("/")).map(|usage| UsageTotals {
        total: usage.total,
        used: usage.used,
        percent: usage.percent,
    })
}

fn net_io() -> NetIoCounters {
    let networks = Networks::new_with_refreshed_list();
    let mut totals = NetIoCounters::default();
    for (_, data) in &networks {
        totals.bytes_sent = totals.bytes_sent.saturating_add(data.total_transmitted());
        totals.bytes_recv = totals.bytes_recv.saturating_add(data.total_received());
        totals.packets_sent = totals
            .packets_sent
            .saturating_add(data.total_packets_transmitted());
        totals.packets_recv = totals
            .packets_recv
            .saturating_add(data.total_packets_received());
    }
    totals
}
