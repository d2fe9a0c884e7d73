// ABOUTME: TCP port probing and listener-table inspection
// ABOUTME: Linux reads /proc/net/tcp{,6}; macOS parses lsof field output

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{debug, warn};

/// Lowest port considered when searching for a free one
pub const MIN_USER_PORT: u16 = 1024;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(150);

/// A socket in LISTEN state and its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub port: u16,
    pub pid: u32,
    /// Short process name when the OS reports one
    pub command: Option<String>,
}

/// Whether `port` can be bound on the loopback interface.
///
/// A successful bind is double-checked with a connect, since some platforms
/// allow a loopback bind to shadow a wildcard listener.
pub fn is_port_available(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    match TcpListener::bind(addr) {
        Ok(listener) => drop(listener),
        Err(e) => {
            debug!("Port {} bind failed: {}", port, e);
            return false;
        }
    }

    TcpStream::connect_timeout(&addr, CONNECT_PROBE_TIMEOUT).is_err()
}

/// Next free port after `after`, probing at most `attempts` ports and
/// wrapping within the unprivileged range
pub fn next_available_port(after: u16, attempts: u16) -> Option<u16> {
    let span = u32::from(u16::MAX - MIN_USER_PORT) + 1;
    let base = u32::from(after.max(MIN_USER_PORT - 1)) + 1 - u32::from(MIN_USER_PORT);

    (0..u32::from(attempts))
        .map(|offset| MIN_USER_PORT + ((base + offset) % span) as u16)
        .find(|&port| port != after && is_port_available(port))
}

/// PIDs holding a LISTEN socket on `port`
pub async fn find_pids_on_port(port: u16) -> Vec<u32> {
    let mut pids: Vec<u32> = list_listeners(port..=port)
        .await
        .into_iter()
        .map(|listener| listener.pid)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// All listeners whose port falls inside `ports`
#[cfg(target_os = "linux")]
pub async fn list_listeners(ports: RangeInclusive<u16>) -> Vec<Listener> {
    match tokio::task::spawn_blocking(move || linux::listeners(&ports)).await {
        Ok(listeners) => listeners,
        Err(e) => {
            warn!("Listener scan task failed: {}", e);
            Vec::new()
        }
    }
}

#[cfg(target_os = "macos")]
pub async fn list_listeners(ports: RangeInclusive<u16>) -> Vec<Listener> {
    use std::process::Stdio;
    use tokio::process::Command;

    let output = match Command::new("lsof")
        .args(["-nP", "-iTCP", "-sTCP:LISTEN", "-F", "pcn"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            warn!("Failed to run lsof: {}", e);
            return Vec::new();
        }
    };

    // lsof exits 1 when nothing matches
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_lsof_listeners(&stdout)
        .into_iter()
        .filter(|listener| ports.contains(&listener.port))
        .collect()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub async fn list_listeners(_ports: RangeInclusive<u16>) -> Vec<Listener> {
    warn!("Listener scanning not supported on this platform");
    Vec::new()
}

/// Parse a `/proc/net/tcp` style table into `(port, inode)` for LISTEN rows
pub fn parse_proc_net_tcp(content: &str) -> Vec<(u16, u64)> {
    const LISTEN_STATE: &str = "0A";

    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 || parts[3] != LISTEN_STATE {
                return None;
            }
            let (_, port_hex) = parts[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = parts[9].parse::<u64>().ok()?;
            // Inode 0 means the socket is not owned by any visible process
            (inode != 0).then_some((port, inode))
        })
        .collect()
}

/// Parse `lsof -F pcn` output into listeners
pub fn parse_lsof_listeners(output: &str) -> Vec<Listener> {
    let mut listeners = Vec::new();
    let mut pid: Option<u32> = None;
    let mut command: Option<String> = None;

    for line in output.lines() {
        let Some(field) = line.chars().next() else {
            continue;
        };
        let value = &line[field.len_utf8()..];

        match field {
            'p' => {
                pid = value.parse().ok();
                command = None;
            }
            'c' => command = Some(value.to_string()),
            'n' => {
                let Some(pid) = pid else { continue };
                let port = value
                    .rsplit_once(':')
                    .and_then(|(_, port)| port.parse::<u16>().ok());
                if let Some(port) = port {
                    let listener = Listener {
                        port,
                        pid,
                        command: command.clone(),
                    };
                    // IPv4 and IPv6 sockets of one process show up twice
                    if !listeners.contains(&listener) {
                        listeners.push(listener);
                    }
                }
            }
            _ => {}
        }
    }

    listeners
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::fs;

    pub(super) fn listeners(ports: &RangeInclusive<u16>) -> Vec<Listener> {
        let mut wanted: BTreeMap<u64, u16> = BTreeMap::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match fs::read_to_string(table) {
                Ok(content) => {
                    for (port, inode) in parse_proc_net_tcp(&content) {
                        if ports.contains(&port) {
                            wanted.insert(inode, port);
                        }
                    }
                }
                Err(e) => debug!("Could not read {}: {}", table, e),
            }
        }

        if wanted.is_empty() {
            return Vec::new();
        }

        let owners = socket_owners(&wanted);
        let mut listeners: Vec<Listener> = Vec::new();
        for (inode, port) in wanted {
            if let Some(&pid) = owners.get(&inode) {
                let listener = Listener {
                    port,
                    pid,
                    command: process_name(pid),
                };
                if !listeners.contains(&listener) {
                    listeners.push(listener);
                }
            } else {
                debug!("No visible owner for listener on port {}", port);
            }
        }
        listeners.sort_by_key(|listener| (listener.port, listener.pid));
        listeners
    }

    /// Map socket inodes to the first PID holding them open
    fn socket_owners(wanted: &BTreeMap<u64, u16>) -> HashMap<u64, u32> {
        let mut owners = HashMap::new();
        let Ok(proc_dir) = fs::read_dir("/proc") else {
            return owners;
        };

        for entry in proc_dir.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Other users' fd directories are unreadable; skip them
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                let Ok(link) = fs::read_link(fd.path()) else {
                    continue;
                };
                let inode = link
                    .to_str()
                    .and_then(|s| s.strip_prefix("socket:["))
                    .and_then(|s| s.strip_suffix(']'))
                    .and_then(|s| s.parse::<u64>().ok());
                if let Some(inode) = inode {
                    if wanted.contains_key(&inode) {
                        owners.entry(inode).or_insert(pid);
                    }
                }
            }
            if owners.len() == wanted.len() {
                break;
            }
        }
        owners
    }

    fn process_name(pid: u32) -> Option<String> {
        fs::read_to_string(format!("/proc/{}/comm", pid))
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    }
}
