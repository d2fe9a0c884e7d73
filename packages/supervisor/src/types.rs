use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Identifier assigned to a project when it enters the registry
pub type ProjectId = Uuid;

/// Default Metro bundler port
pub const DEFAULT_METRO_PORT: u16 = 8081;

/// Dev server flavour of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectType {
    Expo,
    ReactNativeCli,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Expo => "expo",
            ProjectType::ReactNativeCli => "react-native-cli",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProjectType::Expo => "Expo",
            ProjectType::ReactNativeCli => "React Native CLI",
        }
    }

    /// Parse a type token as written in the type-override marker file
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_lowercase().as_str() {
            "expo" => Some(ProjectType::Expo),
            "react-native" | "react-native-cli" | "cli" => Some(ProjectType::ReactNativeCli),
            _ => None,
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Supervision state of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    ResolvingPortConflict,
    Running,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::ResolvingPortConflict => "resolving-port-conflict",
            ProjectStatus::Running => "running",
            ProjectStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a project entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectOrigin {
    /// Added explicitly; persisted across restarts
    User,
    /// Created by a discovery pass; never persisted
    Discovered,
}

/// Severity assigned to a log line by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Info,
    Success,
    Warning,
    Error,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Info => "info",
            LogType::Success => "success",
            LogType::Warning => "warning",
            LogType::Error => "error",
        }
    }
}

/// One classified, ANSI-stripped line of dev server output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub timestamp: DateTime<Utc>,
    /// Position in the project's log, assigned when the entry is stored.
    /// Increases across restarts and clears, so it works as a read cursor.
    #[serde(default)]
    pub seq: u64,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, log_type: LogType) -> Self {
        Self {
            message: message.into(),
            log_type,
            timestamp: Utc::now(),
            seq: 0,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message, LogType::Info)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, LogType::Error)
    }
}

/// Read-only view of a project handed to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub id: ProjectId,
    pub name: String,
    pub path: Option<PathBuf>,
    pub port: u16,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    pub status: ProjectStatus,
    pub is_running: bool,
    pub is_external_process: bool,
    pub external_process_id: Option<u32>,
    pub retry_count: u32,
    pub should_retry: bool,
    pub origin: ProjectOrigin,
    pub type_overridden: bool,
    pub log_count: usize,
}

/// Project attribute named in a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectField {
    Status,
    Port,
    Name,
    Path,
    Type,
    External,
    Retry,
    /// Log store changed by a maintenance operation
    Logs,
}

/// Notification published after a registry mutation has been fully applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    ProjectAdded { id: ProjectId },
    ProjectRemoved { id: ProjectId },
    ProjectChanged { id: ProjectId, fields: Vec<ProjectField> },
    LogsAppended { id: ProjectId, count: usize },
}

/// Error types for supervisor operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Project not found: {id}")]
    ProjectNotFound { id: ProjectId },

    #[error("Invalid project path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Port {port} is still in use after attempting to free it (pids: {pids:?})")]
    PortConflict { port: u16, pids: Vec<u32> },

    #[error("Failed to spawn process '{command}': {reason}")]
    SpawnFailure { command: String, reason: String },

    #[error("Process exited unexpectedly while starting ({status})")]
    UnexpectedExit { status: String },

    #[error("Port conflict detected in dev server output on port {port}")]
    ConflictDetected { port: u16 },

    #[error("Failed to terminate process {pid}: {reason}")]
    TerminationFailure { pid: u32, reason: String },

    #[error("Project {id} is not backed by an external process")]
    NotExternal { id: ProjectId },

    #[error("Invalid port: {port}")]
    InvalidPort { port: u16 },

    #[error("Project {id} is running; stop it first")]
    ProjectRunning { id: ProjectId },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;
