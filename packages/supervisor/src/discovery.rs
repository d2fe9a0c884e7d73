// ABOUTME: Discovery of Metro and Expo servers started outside the supervisor
// ABOUTME: Unions a listener scan with a process-table scan and plans registry upserts

use crate::port::{list_listeners, Listener};
use crate::types::{ProjectId, DEFAULT_METRO_PORT};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use sysinfo::System;
use tracing::{debug, warn};

static PROJECT_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)(/\S*?)/node_modules/\.bin/").expect("project path pattern is valid")
});

static PORT_FLAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--port(?:=|\s+)(\d{1,5})\b").expect("port flag pattern is valid"));

/// Launchers whose process is the dev server itself
const DEV_SERVER_COMMANDS: &[&str] = &["expo start", "react-native start", "metro"];

/// Hints that a listener in the scan window belongs to a JS dev server
const DEV_SERVER_HINTS: &[&str] = &["node", "expo", "metro", "react-native"];

const SHELLS: &[&str] = &["sh", "bash", "zsh", "fish", "dash"];

/// A dev server found running outside the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub port: u16,
    pub pid: u32,
    pub command_line: String,
    pub working_dir: Option<PathBuf>,
}

/// Where a discovered server's project lives, as far as can be told
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// `None` when neither the command line nor the cwd names a project
    pub path: Option<PathBuf>,
    pub name: String,
}

/// Name given to discovered projects whose path is unknown
pub fn placeholder_name(port: u16) -> String {
    format!("Metro :{}", port)
}

/// Project root named by a `<root>/node_modules/.bin/` segment
pub fn extract_project_path(command_line: &str) -> Option<PathBuf> {
    PROJECT_PATH
        .captures(command_line)
        .and_then(|captures| captures.get(1))
        .map(|root| PathBuf::from(root.as_str()))
        .filter(|root| root.as_os_str().len() > 1)
}

/// Value of `--port <n>` or `--port=<n>`
pub fn parse_port_flag(command_line: &str) -> Option<u16> {
    PORT_FLAG
        .captures(command_line)
        .and_then(|captures| captures.get(1))
        .and_then(|port| port.as_str().parse::<u16>().ok())
        .filter(|&port| port > 0)
}

/// Resolve path and name: command line first, then the working directory
pub fn resolve_identity(server: &DiscoveredServer) -> ResolvedIdentity {
    let path = extract_project_path(&server.command_line).or_else(|| {
        server
            .working_dir
            .clone()
            .filter(|dir| dir.parent().is_some())
    });

    let name = path
        .as_deref()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| placeholder_name(server.port));

    ResolvedIdentity { path, name }
}

/// Command line of a process that is itself a dev server
pub fn is_dev_server_command(command_line: &str) -> bool {
    let lower = command_line.to_lowercase();
    DEV_SERVER_COMMANDS.iter().any(|pattern| lower.contains(pattern))
}

fn looks_like_dev_server(command_line: &str) -> bool {
    let lower = command_line.to_lowercase();
    DEV_SERVER_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Wrappers and tools that mention dev server commands without being one
fn is_excluded(name: &str, command_line: &str) -> bool {
    let name = name.to_lowercase();
    let first_arg = command_line
        .split_whitespace()
        .next()
        .and_then(|arg| Path::new(arg).file_name())
        .map(|arg| arg.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    SHELLS.contains(&name.as_str())
        || SHELLS.contains(&first_arg.as_str())
        || name == "grep"
        || first_arg == "grep"
        || first_arg == "npx"
        || command_line.contains("npm exec")
}

/// Process table entry reduced to what discovery needs
#[derive(Debug, Clone)]
struct ProcessInfo {
    pid: u32,
    name: String,
    command_line: String,
    working_dir: Option<PathBuf>,
}

fn process_table() -> Vec<ProcessInfo> {
    let mut system = System::new();
    system.refresh_processes();

    system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessInfo {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            command_line: process.cmd().join(" "),
            working_dir: process.cwd().map(Path::to_path_buf),
        })
        .collect()
}

/// Combine listener and process-table hits.
///
/// Listener hits come first and win their port. Entries are keyed by PID and
/// then de-duplicated by port, first one wins.
fn merge_candidates(
    listeners: &[Listener],
    processes: &[ProcessInfo],
    ignore: &HashSet<u32>,
) -> Vec<DiscoveredServer> {
    let by_pid: HashMap<u32, &ProcessInfo> = processes.iter().map(|p| (p.pid, p)).collect();
    let mut candidates: Vec<DiscoveredServer> = Vec::new();
    let mut seen_pids: HashSet<u32> = HashSet::new();

    let mut listeners: Vec<&Listener> = listeners.iter().collect();
    listeners.sort_by_key(|listener| (listener.port, listener.pid));
    for listener in listeners {
        if ignore.contains(&listener.pid) || seen_pids.contains(&listener.pid) {
            continue;
        }
        let info = by_pid.get(&listener.pid);
        let command_line = info
            .map(|info| info.command_line.clone())
            .filter(|cmd| !cmd.is_empty())
            .or_else(|| listener.command.clone())
            .unwrap_or_default();
        let name = info
            .map(|info| info.name.clone())
            .or_else(|| listener.command.clone())
            .unwrap_or_default();

        if is_excluded(&name, &command_line) || !looks_like_dev_server(&command_line) {
            debug!(
                "Listener on port {} (PID {}) is not a dev server: {}",
                listener.port, listener.pid, command_line
            );
            continue;
        }

        seen_pids.insert(listener.pid);
        candidates.push(DiscoveredServer {
            port: listener.port,
            pid: listener.pid,
            command_line,
            working_dir: info.and_then(|info| info.working_dir.clone()),
        });
    }

    let mut processes: Vec<&ProcessInfo> = processes.iter().collect();
    processes.sort_by_key(|process| process.pid);
    for process in processes {
        if ignore.contains(&process.pid)
            || seen_pids.contains(&process.pid)
            || !is_dev_server_command(&process.command_line)
            || is_excluded(&process.name, &process.command_line)
        {
            continue;
        }

        seen_pids.insert(process.pid);
        candidates.push(DiscoveredServer {
            port: parse_port_flag(&process.command_line).unwrap_or(DEFAULT_METRO_PORT),
            pid: process.pid,
            command_line: process.command_line.clone(),
            working_dir: process.working_dir.clone(),
        });
    }

    let mut seen_ports: HashSet<u16> = HashSet::new();
    candidates.retain(|server| seen_ports.insert(server.port));
    candidates
}

/// Scanner for externally launched dev servers
#[derive(Debug, Clone)]
pub struct ExternalProcessDiscovery {
    ports: RangeInclusive<u16>,
}

impl ExternalProcessDiscovery {
    pub fn new(ports: RangeInclusive<u16>) -> Self {
        Self { ports }
    }

    pub fn ports(&self) -> &RangeInclusive<u16> {
        &self.ports
    }

    /// One scan of the OS. `ignore` holds PIDs the supervisor owns.
    pub async fn scan(&self, ignore: &HashSet<u32>) -> Vec<DiscoveredServer> {
        let listeners = list_listeners(self.ports.clone()).await;

        let processes = match tokio::task::spawn_blocking(process_table).await {
            Ok(processes) => processes,
            Err(e) => {
                warn!("Process table scan failed: {}", e);
                Vec::new()
            }
        };

        let mut ignore = ignore.clone();
        ignore.insert(std::process::id());

        let servers = merge_candidates(&listeners, &processes, &ignore);
        debug!(
            "Discovery scan found {} dev servers ({} listeners in {}-{})",
            servers.len(),
            listeners.len(),
            self.ports.start(),
            self.ports.end()
        );
        servers
    }
}

/// What reconciliation needs to know about one registered project
#[derive(Debug, Clone)]
pub struct ProjectView {
    pub id: ProjectId,
    pub path: Option<PathBuf>,
    pub port: u16,
    pub is_external: bool,
    pub has_internal_process: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    /// Same project path: adopt the server into that project
    UpdateByPath(ProjectId),
    /// Same port, external owner: refresh that project in place
    UpdateByPort(ProjectId),
    /// An internally managed project owns this server or port
    Skip,
    Create,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertPlan {
    pub action: UpsertAction,
    /// Other external projects on the same port that the update supersedes
    pub displaced: Vec<ProjectId>,
}

/// Decide how a discovered server at `port` with resolved `path` lands in the
/// registry. Never plans a second project for a port already held.
pub fn plan_upsert(views: &[ProjectView], port: u16, path: Option<&Path>) -> UpsertPlan {
    let skip = UpsertPlan {
        action: UpsertAction::Skip,
        displaced: Vec::new(),
    };

    if let Some(path) = path {
        if let Some(view) = views.iter().find(|v| v.path.as_deref() == Some(path)) {
            if view.has_internal_process {
                return skip;
            }
            // The adopted project takes the port; other external holders yield
            let displaced = views
                .iter()
                .filter(|other| other.id != view.id && other.port == port && other.is_external)
                .map(|other| other.id)
                .collect();
            let internal_on_port = views
                .iter()
                .any(|other| other.id != view.id && other.port == port && other.has_internal_process);
            if internal_on_port {
                return skip;
            }
            return UpsertPlan {
                action: UpsertAction::UpdateByPath(view.id),
                displaced,
            };
        }
    }

    let on_port: Vec<&ProjectView> = views.iter().filter(|v| v.port == port).collect();
    if on_port.iter().any(|v| !v.is_external) {
        return skip;
    }
    if let Some(view) = on_port.first() {
        return UpsertPlan {
            action: UpsertAction::UpdateByPort(view.id),
            displaced: on_port.iter().skip(1).map(|v| v.id).collect(),
        };
    }

    UpsertPlan {
        action: UpsertAction::Create,
        displaced: Vec::new(),
    }
}
