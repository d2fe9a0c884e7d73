//! Metrodeck supervisor - lifecycle engine for Metro and Expo dev servers
//!
//! Tracks a registry of React Native projects, spawns and stops their dev
//! servers, resolves port conflicts, ingests their output into bounded log
//! stores and adopts dev servers that were started outside the supervisor.

pub mod config;
pub mod conflict;
pub mod detector;
pub mod discovery;
pub mod env;
pub mod http;
pub mod logs;
pub mod port;
pub mod registry;
pub mod runner;
pub mod storage;
pub mod supervisor;
pub mod types;

// Re-export key types and functions for easier use
pub use config::{default_state_path, SupervisorConfig};
pub use conflict::{is_process_alive, PortConflictResolver};
pub use detector::ProjectDetector;
pub use discovery::{DiscoveredServer, ExternalProcessDiscovery};
pub use http::DevServerClient;
pub use logs::{LogPipeline, LogStore, RetentionPolicy};
pub use port::{find_pids_on_port, is_port_available, next_available_port, Listener};
pub use supervisor::{ReconcileReport, Supervisor};
pub use types::{
    LogEntry, LogType, ProjectField, ProjectId, ProjectOrigin, ProjectSnapshot, ProjectStatus,
    ProjectType, SupervisorError, SupervisorEvent, SupervisorResult, DEFAULT_METRO_PORT,
};

/// Crate version, reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build a supervisor from the environment, restore saved projects and start
/// background reconciliation when it is enabled.
pub async fn init() -> Supervisor {
    Supervisor::init(SupervisorConfig::from_env()).await
}
