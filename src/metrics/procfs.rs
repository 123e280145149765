//! Parsers for the parts of `/proc` sysinfo does not cover: socket tables,
//! per-process socket inodes, cgroup membership, thread counts and block
//! device counters.
use regex::Regex;
use std::{
    collections::{HashMap, HashSet},
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use super::DiskIoCounters;
use crate::constants::DISKSTATS_SECTOR_BYTES;

/// TCP state code for `LISTEN`.
const TCP_LISTEN: u8 = 0x0A;
/// TCP state code for `ESTABLISHED`.
const TCP_ESTABLISHED: u8 = 0x01;

/// One row of `/proc/net/tcp{,6}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: u8,
}

impl SocketEntry {
    pub fn is_listening(&self) -> bool {
        self.state == TCP_LISTEN
    }

    pub fn is_established(&self) -> bool {
        self.state == TCP_ESTABLISHED
    }
}

/// Socket table keyed by inode.
pub type SocketTable = HashMap<u64, SocketEntry>;

fn container_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[0-9a-f]{64}").expect("container id pattern is valid"))
}

/// Access to a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pid_path(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// TCP sockets of the current network namespace, keyed by inode.
    pub fn socket_table(&self) -> SocketTable {
        let mut table = SocketTable::new();
        for file in ["net/tcp", "net/tcp6"] {
            if let Ok(content) = fs::read_to_string(self.root.join(file)) {
                table.extend(parse_socket_table(&content));
            }
        }
        table
    }

    /// Socket inodes held open by `pid`; `None` if its fds cannot be listed.
    pub fn socket_inodes(&self, pid: u32) -> Option<HashSet<u64>> {
        let entries = fs::read_dir(self.pid_path(pid).join("fd")).ok()?;
        let inodes = entries
            .flatten()
            .filter_map(|entry| fs::read_link(entry.path()).ok())
            .filter_map(|target| parse_socket_link(&target.to_string_lossy()))
            .collect();
        Some(inodes)
    }

    /// Container id from `/proc/<pid>/cgroup`, if the process runs in one.
    pub fn container_id(&self, pid: u32) -> Option<String> {
        let content = fs::read_to_string(self.pid_path(pid).join("cgroup")).ok()?;
        parse_container_id(&content)
    }

    /// Thread count from `/proc/<pid>/status`.
    pub fn thread_count(&self, pid: u32) -> Option<u64> {
        let content = fs::read_to_string(self.pid_path(pid).join("status")).ok()?;
        content
            .lines()
            .find_map(|line| line.strip_prefix("Threads:"))
            .and_then(|value| value.trim().parse().ok())
    }

    /// Whole-disk read/write bytes from `/proc/diskstats`.
    pub fn disk_io(&self) -> Option<DiskIoCounters> {
        let content = fs::read_to_string(self.root.join("diskstats")).ok()?;
        Some(parse_diskstats(&content))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Listening ports and established peers of one process.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessSockets {
    pub listening_ports: Vec<u16>,
    pub established: Vec<(SocketAddr, SocketAddr)>,
}

/// Joins a process's socket inodes with the socket table.
pub fn process_sockets(table: &SocketTable, inodes: &HashSet<u64>) -> ProcessSockets {
    let mut sockets = ProcessSockets::default();
    for inode in inodes {
        let Some(entry) = table.get(inode) else {
            continue;
        };
        if entry.is_listening() {
            if !sockets.listening_ports.contains(&entry.local.port()) {
                sockets.listening_ports.push(entry.local.port());
            }
        } else if entry.is_established() {
            sockets.established.push((entry.local, entry.remote));
        }
    }
    sockets.listening_ports.sort_unstable();
    sockets.established.sort();
    sockets
}

/// Parses the body of `/proc/net/tcp` or `/proc/net/tcp6`.
pub fn parse_socket_table(content: &str) -> SocketTable {
    let mut table = SocketTable::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let (Some(local), Some(remote)) = (parse_hex_socket(fields[1]), parse_hex_socket(fields[2]))
        else {
            continue;
        };
        let Ok(state) = u8::from_str_radix(fields[3], 16) else {
            continue;
        };
        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };
        if inode == 0 {
            continue;
        }
        table.insert(
            inode,
            SocketEntry {
                local,
                remote,
                state,
            },
        );
    }
    table
}

/// Parses `ADDR:PORT` in the kernel's hex notation.
fn parse_hex_socket(field: &str) -> Option<SocketAddr> {
    let (address, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match address.len() {
        8 => {
            let word = u32::from_str_radix(address, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_le_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (index, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&address[index * 8..index * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Extracts the inode from a `socket:[12345]` fd link.
fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Finds a docker or kubernetes container id in cgroup membership lines.
pub fn parse_container_id(content: &str) -> Option<String> {
    for line in content.lines() {
        let path = line.splitn(3, ':').nth(2).unwrap_or(line);
        if !(path.contains("docker") || path.contains("kubepods")) {
            continue;
        }
        if let Some(found) = container_id_pattern().find(path) {
            return Some(found.as_str().to_string());
        }
        if let Some(segment) = path.rsplit('/').find(|segment| !segment.is_empty()) {
            return Some(segment.to_string());
        }
    }
    None
}

/// Sums sectors read/written over whole disks in `/proc/diskstats`.
///
/// Partitions (whose parent device is also listed) and loop/ram devices are
/// skipped so bytes are not counted twice.
pub fn parse_diskstats(content: &str) -> DiskIoCounters {
    let rows: Vec<(&str, u64, u64)> = content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let sectors_read = fields[5].parse().ok()?;
            let sectors_written = fields[9].parse().ok()?;
            Some((fields[2], sectors_read, sectors_written))
        })
        .collect();
    let names: HashSet<&str> = rows.iter().map(|(name, _, _)| *name).collect();

    let mut totals = DiskIoCounters::default();
    for (name, sectors_read, sectors_written) in &rows {
        if name.starts_with("loop") || name.starts_with("ram") {
            continue;
        }
        let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
        if base.len() != name.len() {
            let parent = base.strip_suffix('p').unwrap_or(base);
            if names.contains(base) || names.contains(parent) {
                continue;
            }
        }
        totals.read_bytes = totals
            .read_bytes
            .saturating_add(sectors_read.saturating_mul(DISKSTATS_SECTOR_BYTES));
        totals.write_bytes = totals
            .write_bytes
            .saturating_add(sectors_written.saturating_mul(DISKSTATS_SECTOR_BYTES));
    }
    totals
}
