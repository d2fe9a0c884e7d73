// ABOUTME: Supervisor coordinating project lifecycles, log ingestion and reconciliation
// ABOUTME: Drives the start/stop state machine and publishes change events

use crate::config::SupervisorConfig;
use crate::conflict::{is_process_alive, PortConflictResolver};
use crate::detector::{ProjectDetector, DEFAULT_PROJECT_TYPE};
use crate::discovery::{
    plan_upsert, resolve_identity, DiscoveredServer, ExternalProcessDiscovery, ResolvedIdentity,
    UpsertAction,
};
use crate::http::DevServerClient;
use crate::logs::{LogPipeline, OutputSignal};
use crate::port::{is_port_available, next_available_port};
use crate::registry::{Project, ProjectRegistry, ProjectSlot};
use crate::runner::{self, ProcessEvent, ProcessHandle};
use crate::storage::{PersistedProject, PersistedState, ProjectStore};
use crate::types::{
    LogEntry, LogType, ProjectField, ProjectId, ProjectOrigin, ProjectSnapshot, ProjectStatus,
    ProjectType, SupervisorError, SupervisorEvent, SupervisorResult, DEFAULT_METRO_PORT,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Ports probed when a conflict retry looks for a new port
const PORT_SEARCH_ATTEMPTS: u16 = 100;

/// How long a freed port may take to become bindable
const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for another project's operation lock before going around it
const OWNER_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    /// Explicit or hand-off start; resets the conflict retry budget
    Fresh,
    /// Automatic restart after a conflict in output
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandOff {
    Allow,
    Suppress,
}

#[derive(Debug, Clone, Copy)]
enum DevServerCommand {
    Reload,
    ResetCache,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Entries left alone because a user operation held them or an
    /// internally managed project took precedence
    pub skipped: usize,
}

struct Background {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    registry: ProjectRegistry,
    events: broadcast::Sender<SupervisorEvent>,
    resolver: PortConflictResolver,
    discovery: ExternalProcessDiscovery,
    http: DevServerClient,
    store: Option<ProjectStore>,
    type_overrides: RwLock<BTreeMap<PathBuf, ProjectType>>,
    /// Serializes reconciliation passes
    reconcile_lock: Mutex<()>,
    persist_lock: Mutex<()>,
    background: Mutex<Option<Background>>,
    shutting_down: AtomicBool,
}

/// Owns every tracked project and the background reconciliation loop.
///
/// Cheap to clone; clones share the same state. All mutations of a project go
/// through its slot's operation lock, so a user operation and a
/// reconciliation pass never act on the same project at once.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Create a supervisor without loading state or starting the background loop
    pub fn new(config: SupervisorConfig) -> Self {
        let http = DevServerClient::new(config.http_timeout);
        Self::with_dev_server_client(config, http)
    }

    /// Like [`Supervisor::new`] with a custom client for dev server endpoints
    pub fn with_dev_server_client(config: SupervisorConfig, http: DevServerClient) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(SupervisorInner {
                resolver: PortConflictResolver::new(config.termination_grace),
                discovery: ExternalProcessDiscovery::new(config.discovery_ports.clone()),
                store: config.state_path.clone().map(ProjectStore::new),
                http,
                registry: ProjectRegistry::new(),
                events,
                type_overrides: RwLock::new(BTreeMap::new()),
                reconcile_lock: Mutex::new(()),
                persist_lock: Mutex::new(()),
                background: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Load persisted projects and start background reconciliation when enabled
    pub async fn init(config: SupervisorConfig) -> Self {
        let supervisor = Self::new(config);

        match supervisor.load_state().await {
            Ok(count) => debug!("Restored {} projects", count),
            Err(e) => warn!("Failed to load persisted projects: {}", e),
        }

        if supervisor.inner.config.discovery_enabled {
            supervisor.start_background().await;
        }
        supervisor
    }

    /// Stop the background loop, stop every owned process and save state
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down supervisor");

        let background = self.inner.background.lock().await.take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            if let Err(e) = background.task.await {
                warn!("Background reconciliation ended abnormally: {}", e);
            }
        }

        let stopped = self.stop_all().await;
        debug!("Stopped {} processes during shutdown", stopped);
        self.persist().await;
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub async fn list_projects(&self) -> Vec<ProjectSnapshot> {
        self.inner.registry.snapshots().await
    }

    pub async fn project(&self, id: ProjectId) -> Option<ProjectSnapshot> {
        match self.inner.registry.get(id).await {
            Some(slot) => Some(slot.snapshot().await),
            None => None,
        }
    }

    /// Log entries newer than `since`, keeping only the newest `limit`
    pub async fn logs(
        &self,
        id: ProjectId,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> SupervisorResult<Vec<LogEntry>> {
        let slot = self.slot(id).await?;
        let project = slot.state.lock().await;
        Ok(project.logs.query(since, limit))
    }

    /// Entries stored after the entry numbered `seq`. Pass the last `seq` a
    /// reader has seen to follow a project's log without gaps or repeats.
    pub async fn logs_after(&self, id: ProjectId, seq: u64) -> SupervisorResult<Vec<LogEntry>> {
        let slot = self.slot(id).await?;
        let project = slot.state.lock().await;
        Ok(project.logs.after(seq))
    }

    // === PROJECT MANAGEMENT ===

    /// Register a project directory. Adding a path that is already tracked
    /// returns the existing id.
    pub async fn add_project(
        &self,
        path: impl AsRef<Path>,
        name: Option<String>,
        port: Option<u16>,
    ) -> SupervisorResult<ProjectId> {
        let path = path.as_ref();
        ProjectDetector::validate_project_path(path)?;
        let path = std::fs::canonicalize(path)?;

        if port == Some(0) {
            return Err(SupervisorError::InvalidPort { port: 0 });
        }

        if let Some(existing) = self.inner.registry.find_by_path(&path).await {
            let adopted = {
                let mut project = existing.state.lock().await;
                let adopted = project.origin == ProjectOrigin::Discovered;
                project.origin = ProjectOrigin::User;
                adopted
            };
            if adopted {
                info!("Project at {} is now user managed", path.display());
                self.persist().await;
            }
            return Ok(existing.id);
        }

        let user_override = self.inner.type_overrides.read().await.get(&path).copied();
        let project_type =
            ProjectDetector::detect_project_type(&path, user_override, DEFAULT_PROJECT_TYPE);
        let name = name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| project_name_from_path(&path));

        let mut project = Project::new(
            name,
            Some(path.clone()),
            port.unwrap_or(DEFAULT_METRO_PORT),
            project_type,
            ProjectOrigin::User,
            self.inner.config.retention,
        );
        project.type_overridden = user_override.is_some();
        let id = project.id;

        self.inner.registry.insert(project).await;
        info!(
            "Added {} project {} at {}",
            project_type.display_name(),
            id,
            path.display()
        );
        self.emit(SupervisorEvent::ProjectAdded { id });
        self.persist().await;
        Ok(id)
    }

    /// Forget a project, stopping its process first if the supervisor owns one
    pub async fn remove_project(&self, id: ProjectId) -> SupervisorResult<()> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;

        let owns_process = slot.state.lock().await.has_internal_process();
        if owns_process {
            self.stop_locked(&slot, HandOff::Suppress).await?;
        }

        self.inner.registry.remove(id).await;
        info!("Removed project {}", id);
        self.emit(SupervisorEvent::ProjectRemoved { id });
        self.persist().await;
        Ok(())
    }

    /// Pin a project's type. The choice survives restarts and wins over any
    /// later detection.
    pub async fn set_project_type(
        &self,
        id: ProjectId,
        project_type: ProjectType,
    ) -> SupervisorResult<()> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;

        let path = {
            let mut project = slot.state.lock().await;
            project.project_type = project_type;
            project.type_overridden = true;
            project.path.clone()
        };

        if let Some(path) = path {
            self.inner
                .type_overrides
                .write()
                .await
                .insert(path.clone(), project_type);
            if let Err(e) = ProjectDetector::write_type_marker(&path, project_type) {
                warn!("Could not write type marker in {}: {}", path.display(), e);
            }
        }

        self.changed(id, vec![ProjectField::Type]);
        self.persist().await;
        Ok(())
    }

    pub async fn set_project_port(&self, id: ProjectId, port: u16) -> SupervisorResult<()> {
        if port == 0 {
            return Err(SupervisorError::InvalidPort { port });
        }

        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        {
            let mut project = slot.state.lock().await;
            if project.is_running() {
                return Err(SupervisorError::ProjectRunning { id });
            }
            if project.port == port {
                return Ok(());
            }
            project.port = port;
        }

        self.changed(id, vec![ProjectField::Port]);
        self.persist().await;
        Ok(())
    }

    pub async fn rename_project(&self, id: ProjectId, name: &str) -> SupervisorResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(());
        }

        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        slot.state.lock().await.name = name.to_string();

        self.changed(id, vec![ProjectField::Name]);
        self.persist().await;
        Ok(())
    }

    // === LOG MAINTENANCE ===

    pub async fn clear_logs(&self, id: ProjectId) -> SupervisorResult<()> {
        let slot = self.slot(id).await?;
        slot.state.lock().await.logs.clear();
        self.changed(id, vec![ProjectField::Logs]);
        Ok(())
    }

    /// Drop every non-error entry. Returns how many were removed.
    pub async fn force_cleanup_logs(&self, id: ProjectId) -> SupervisorResult<usize> {
        let slot = self.slot(id).await?;
        let removed = slot.state.lock().await.logs.force_cleanup();
        self.changed(id, vec![ProjectField::Logs]);
        Ok(removed)
    }

    /// Collapse repeated consecutive messages. Returns how many entries were folded.
    pub async fn compress_logs(&self, id: ProjectId) -> SupervisorResult<usize> {
        let slot = self.slot(id).await?;
        let folded = slot.state.lock().await.logs.compress();
        self.changed(id, vec![ProjectField::Logs]);
        Ok(folded)
    }

    /// Trim to the soft cap now, including engine notes that skip the
    /// per-ingest check
    pub async fn trim_logs(&self, id: ProjectId) -> SupervisorResult<Option<usize>> {
        let slot = self.slot(id).await?;
        let purged = slot.state.lock().await.logs.trim_to_cap();
        if purged.is_some() {
            self.changed(id, vec![ProjectField::Logs]);
        }
        Ok(purged)
    }

    // === DEV SERVER COMMANDS ===

    /// Ask connected apps to reload. Returns whether the server acknowledged.
    pub async fn reload_app(&self, id: ProjectId) -> SupervisorResult<bool> {
        self.dev_server_command(id, DevServerCommand::Reload).await
    }

    /// Clear the bundler cache. Returns whether the server acknowledged.
    pub async fn reset_cache(&self, id: ProjectId) -> SupervisorResult<bool> {
        self.dev_server_command(id, DevServerCommand::ResetCache).await
    }

    async fn dev_server_command(
        &self,
        id: ProjectId,
        command: DevServerCommand,
    ) -> SupervisorResult<bool> {
        let slot = self.slot(id).await?;
        let port = slot.state.lock().await.port;

        let (label, result) = match command {
            DevServerCommand::Reload => ("Reload", self.inner.http.reload(port).await),
            DevServerCommand::ResetCache => ("Cache reset", self.inner.http.reset_cache(port).await),
        };

        let (acknowledged, entry) = match result {
            Ok(true) => (
                true,
                LogEntry::new(format!("{} requested on port {}", label, port), LogType::Success),
            ),
            Ok(false) => (
                false,
                LogEntry::new(
                    format!("{} on port {} was not acknowledged", label, port),
                    LogType::Warning,
                ),
            ),
            Err(e) => {
                debug!("{} on port {} failed: {}", label, port, e);
                (
                    false,
                    LogEntry::new(
                        format!("{} failed on port {}: {}", label, port, e),
                        LogType::Warning,
                    ),
                )
            }
        };

        slot.state.lock().await.logs.push(entry);
        self.emit(SupervisorEvent::LogsAppended { id, count: 1 });
        Ok(acknowledged)
    }

    // === LIFECYCLE ===

    /// Start a project's dev server. A no-op when it is already running.
    ///
    /// Readiness is reported later through events, not by this call.
    pub async fn start(&self, id: ProjectId) -> SupervisorResult<()> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        self.start_locked(&slot, StartMode::Fresh).await
    }

    /// Stop a project. External projects are stopped by PID; projects with
    /// nothing running are left untouched.
    pub async fn stop(&self, id: ProjectId) -> SupervisorResult<()> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        self.stop_locked(&slot, HandOff::Allow).await
    }

    /// Stop a dev server the supervisor did not spawn
    pub async fn stop_external(&self, id: ProjectId) -> SupervisorResult<()> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        self.stop_external_locked(&slot, HandOff::Allow).await
    }

    /// Stop every process the supervisor owns. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for slot in self.inner.registry.slots().await {
            let _op = slot.op.lock().await;
            let owns_process = slot.state.lock().await.has_internal_process();
            if !owns_process {
                continue;
            }
            match self.stop_locked(&slot, HandOff::Suppress).await {
                Ok(()) => stopped += 1,
                Err(e) => error!("Failed to stop project {}: {}", slot.id, e),
            }
        }
        stopped
    }

    /// Free `port` for the caller, stopping our own projects on it through
    /// their normal stop path and terminating anything else
    pub async fn free_port(&self, port: u16) -> SupervisorResult<()> {
        if is_port_available(port) {
            return Ok(());
        }
        self.clear_port(Uuid::nil(), port).await
    }

    async fn start_locked(&self, slot: &Arc<ProjectSlot>, mode: StartMode) -> SupervisorResult<()> {
        let id = slot.id;

        let (path, port, project_type, leftover) = {
            let mut project = slot.state.lock().await;
            if project.is_running() {
                debug!("Project {} is already running", id);
                return Ok(());
            }
            if mode == StartMode::Fresh {
                project.retry_count = 0;
                project.should_retry = false;
            }
            (
                project.path.clone(),
                project.port,
                project.project_type,
                project.has_internal_process(),
            )
        };

        // A process left behind by a conflict or a failed stop goes first
        if leftover {
            self.stop_locked(slot, HandOff::Suppress).await?;
        }

        let Some(path) = path else {
            let err = SupervisorError::InvalidPath {
                path: PathBuf::new(),
                reason: "project path is unknown".to_string(),
            };
            self.fail(slot, &err).await;
            return Err(err);
        };

        if let Err(e) = ProjectDetector::validate_project_path(&path) {
            self.fail(slot, &e).await;
            return Err(e);
        }

        if !is_port_available(port) {
            {
                let mut project = slot.state.lock().await;
                project.status = ProjectStatus::ResolvingPortConflict;
                project.log(
                    LogType::Warning,
                    format!("Port {} is in use, attempting to free it", port),
                );
            }
            self.changed(id, vec![ProjectField::Status]);

            if let Err(e) = self.clear_port(id, port).await {
                self.fail(slot, &e).await;
                return Err(e);
            }
        }

        let command = match ProjectDetector::launch_command(project_type, &path, port) {
            Ok(command) => command,
            Err(e) => {
                self.fail(slot, &e).await;
                return Err(e);
            }
        };

        {
            let mut project = slot.state.lock().await;
            project.logs.clear();
            project.clear_external();
            project.status = ProjectStatus::Starting;
            project.log(
                LogType::Info,
                format!(
                    "Starting {} dev server on port {}: {}",
                    project_type.display_name(),
                    port,
                    command.display()
                ),
            );
        }
        self.emit(SupervisorEvent::LogsAppended { id, count: 1 });
        self.changed(id, vec![ProjectField::Status, ProjectField::External]);

        let spawned = match runner::spawn(&command) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.fail(slot, &e).await;
                return Err(e);
            }
        };

        let pid = spawned.handle.pid();
        {
            let mut project = slot.state.lock().await;
            project.detach_output();
            let run_id = project.run_id;
            project.process = Some(spawned.handle);
            project.ingest_task = Some(self.spawn_ingest(slot.clone(), run_id, spawned.events));
        }
        info!("Started project {} on port {} (PID {})", id, port, pid);
        self.changed(id, vec![ProjectField::Status]);
        Ok(())
    }

    async fn stop_locked(&self, slot: &Arc<ProjectSlot>, handoff: HandOff) -> SupervisorResult<()> {
        let id = slot.id;

        let (handle, port) = {
            let mut project = slot.state.lock().await;
            if project.is_external_process {
                drop(project);
                return self.stop_external_locked(slot, handoff).await;
            }
            let Some(handle) = project.process.clone() else {
                debug!("Project {} has no process to stop", id);
                return Ok(());
            };
            // Detach before signalling so nothing more lands in the log
            project.detach_output();
            (handle, project.port)
        };

        match self.terminate_handle(&handle).await {
            Ok(()) => {
                {
                    let mut project = slot.state.lock().await;
                    project.process = None;
                    project.status = ProjectStatus::Stopped;
                    project.should_retry = false;
                    project.log(LogType::Info, "Dev server stopped");
                }
                info!("Stopped project {} (PID {})", id, handle.pid());
                self.emit(SupervisorEvent::LogsAppended { id, count: 1 });
                self.changed(id, vec![ProjectField::Status]);
                if handoff == HandOff::Allow {
                    self.spawn_handoff(id, port);
                }
                Ok(())
            }
            Err(e) => {
                slot.state
                    .lock()
                    .await
                    .log(LogType::Error, format!("Failed to stop dev server: {}", e));
                self.emit(SupervisorEvent::LogsAppended { id, count: 1 });
                Err(e)
            }
        }
    }

    async fn stop_external_locked(
        &self,
        slot: &Arc<ProjectSlot>,
        handoff: HandOff,
    ) -> SupervisorResult<()> {
        let id = slot.id;

        let (pid, port, origin, path_known) = {
            let project = slot.state.lock().await;
            if !project.is_external_process {
                return Err(SupervisorError::NotExternal { id });
            }
            (
                project.external_process_id,
                project.port,
                project.origin,
                project.path.is_some(),
            )
        };

        let result = match pid {
            Some(pid) => match self.inner.resolver.terminate_pid(pid).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!("Stopping PID {} failed ({}), falling back to port {}", pid, e, port);
                    self.terminate_port_outsiders(port).await
                }
            },
            None => self.terminate_port_outsiders(port).await,
        };

        if let Err(e) = result {
            slot.state.lock().await.log(
                LogType::Error,
                format!("Failed to stop external dev server: {}", e),
            );
            self.emit(SupervisorEvent::LogsAppended { id, count: 1 });
            return Err(e);
        }

        {
            let mut project = slot.state.lock().await;
            project.clear_external();
            project.status = ProjectStatus::Stopped;
            project.log(LogType::Info, "External dev server stopped");
        }
        info!("Stopped external dev server of project {} on port {}", id, port);

        if origin == ProjectOrigin::Discovered && !path_known {
            self.inner.registry.remove(id).await;
            self.emit(SupervisorEvent::ProjectRemoved { id });
        } else {
            self.emit(SupervisorEvent::LogsAppended { id, count: 1 });
            self.changed(id, vec![ProjectField::Status, ProjectField::External]);
        }

        if handoff == HandOff::Allow {
            self.spawn_handoff(id, port);
        }
        Ok(())
    }

    /// Terminate listeners on `port` that the supervisor did not spawn
    async fn terminate_port_outsiders(&self, port: u16) -> SupervisorResult<()> {
        let internal: HashSet<u32> = self.inner.registry.internal_pids().await.into_iter().collect();
        let pids: Vec<u32> = self
            .inner
            .resolver
            .owners(port)
            .await
            .into_iter()
            .filter(|pid| !internal.contains(pid))
            .collect();

        self.inner.resolver.terminate_all(&pids).await;
        if pids.is_empty() || self.inner.resolver.wait_until_free(port, PORT_RELEASE_TIMEOUT).await {
            Ok(())
        } else {
            Err(SupervisorError::PortConflict {
                port,
                pids: self.inner.resolver.owners(port).await,
            })
        }
    }

    /// Clear `port` before `requester` starts on it
    async fn clear_port(&self, requester: ProjectId, port: u16) -> SupervisorResult<()> {
        let pids = self.inner.resolver.owners(port).await;
        let mut outsiders = Vec::new();

        for pid in pids {
            match self.inner.registry.find_by_pid(pid).await {
                Some(owner) if owner.id != requester => {
                    info!("Port {} is held by project {}, stopping it", port, owner.id);
                    match tokio::time::timeout(OWNER_LOCK_TIMEOUT, owner.op.lock()).await {
                        Ok(_guard) => {
                            if let Err(e) = self.stop_locked(&owner, HandOff::Suppress).await {
                                warn!("Failed to stop project {}: {}", owner.id, e);
                            }
                        }
                        Err(_) => {
                            warn!("Project {} is busy, terminating PID {} directly", owner.id, pid);
                            outsiders.push(pid);
                        }
                    }
                }
                _ => outsiders.push(pid),
            }
        }

        let survivors = self.inner.resolver.terminate_all(&outsiders).await;
        if !survivors.is_empty() {
            warn!("PIDs {:?} survived termination on port {}", survivors, port);
        }

        if self.inner.resolver.wait_until_free(port, PORT_RELEASE_TIMEOUT).await {
            Ok(())
        } else {
            Err(SupervisorError::PortConflict {
                port,
                pids: self.inner.resolver.owners(port).await,
            })
        }
    }

    /// Graceful signal, grace period, forced signal, grace period
    async fn terminate_handle(&self, handle: &ProcessHandle) -> SupervisorResult<()> {
        let grace = self.inner.config.termination_grace;

        handle.terminate()?;
        if handle.wait_exited(grace).await {
            return Ok(());
        }

        warn!("PID {} did not exit after SIGTERM, sending SIGKILL", handle.pid());
        handle.kill()?;
        if handle.wait_exited(grace).await {
            return Ok(());
        }

        Err(SupervisorError::TerminationFailure {
            pid: handle.pid(),
            reason: "process did not exit after SIGKILL".to_string(),
        })
    }

    fn spawn_handoff(&self, stopped: ProjectId, port: u16) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.hand_off(stopped, port).await;
        });
    }

    /// Start the next stopped project configured for `port`, if any
    async fn hand_off(&self, stopped: ProjectId, port: u16) {
        tokio::time::sleep(self.inner.config.handoff_delay).await;
        if self.is_shutting_down() {
            return;
        }

        for slot in self.inner.registry.slots().await {
            if slot.id == stopped {
                continue;
            }
            let queued = {
                let project = slot.state.lock().await;
                project.port == port
                    && project.status == ProjectStatus::Stopped
                    && !project.is_external_process
                    && !project.has_internal_process()
                    && project.path.is_some()
            };
            if queued {
                info!("Handing port {} over to project {}", port, slot.id);
                if let Err(e) = self.start(slot.id).await {
                    warn!("Hand-off start of project {} failed: {}", slot.id, e);
                }
                return;
            }
        }
    }

    // === OUTPUT INGESTION ===

    fn spawn_ingest(
        &self,
        slot: Arc<ProjectSlot>,
        run_id: u64,
        events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.run_ingest(slot, run_id, events).await;
        })
    }

    async fn run_ingest(
        &self,
        slot: Arc<ProjectSlot>,
        run_id: u64,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        let id = slot.id;
        let mut pipeline = LogPipeline::new();

        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output { stream, chunk } => {
                    let ingested = pipeline.ingest(stream, &chunk);
                    let mut fields = Vec::new();
                    let mut retry = false;

                    let appended = {
                        let mut project = slot.state.lock().await;
                        if project.run_id != run_id {
                            return;
                        }
                        let appended = project.logs.append(ingested.entries);

                        match ingested.signal {
                            Some(OutputSignal::Ready)
                                if project.status == ProjectStatus::Starting =>
                            {
                                project.status = ProjectStatus::Running;
                                fields.push(ProjectField::Status);
                                info!("Project {} is ready on port {}", id, project.port);
                            }
                            Some(OutputSignal::Conflict)
                                if matches!(
                                    project.status,
                                    ProjectStatus::Starting | ProjectStatus::Running
                                ) =>
                            {
                                retry = self.note_conflict(&mut project);
                                fields.extend([ProjectField::Status, ProjectField::Retry]);
                            }
                            _ => {}
                        }
                        appended
                    };

                    if appended > 0 {
                        self.emit(SupervisorEvent::LogsAppended {
                            id,
                            count: appended,
                        });
                    }
                    self.changed(id, fields);
                    if retry {
                        self.spawn_retry(slot.clone(), run_id);
                    }
                }
                ProcessEvent::Exited(exit) => {
                    let trailing = pipeline.finish();
                    let appended = {
                        let mut project = slot.state.lock().await;
                        if project.run_id != run_id {
                            return;
                        }
                        let mark = project.logs.sequence();
                        project.logs.append(trailing);
                        project.process = None;
                        project.ingest_task = None;

                        let status = exit.describe();
                        match project.status {
                            ProjectStatus::Starting => {
                                warn!("Project {} exited while starting ({})", id, status);
                                project.fail(SupervisorError::UnexpectedExit { status }.to_string());
                            }
                            ProjectStatus::Error => {
                                project.log(LogType::Info, format!("Dev server exited ({})", status));
                            }
                            _ => {
                                info!("Project {} exited ({})", id, status);
                                project.status = ProjectStatus::Stopped;
                                project.log(LogType::Warning, format!("Dev server exited ({})", status));
                            }
                        }
                        (project.logs.sequence() - mark) as usize
                    };
                    self.emit(SupervisorEvent::LogsAppended {
                        id,
                        count: appended,
                    });
                    self.changed(id, vec![ProjectField::Status]);
                    return;
                }
            }
        }
    }

    /// Record a conflict seen in output. Returns true when a retry should run.
    fn note_conflict(&self, project: &mut Project) -> bool {
        let max_retries = self.inner.config.max_conflict_retries;
        let conflict = SupervisorError::ConflictDetected { port: project.port };

        if project.retry_count < max_retries {
            project.retry_count += 1;
            project.should_retry = true;
            warn!(
                "Project {}: {}, retry {} of {}",
                project.id, conflict, project.retry_count, max_retries
            );
            let message = format!(
                "{}; retrying on another port ({} of {})",
                conflict, project.retry_count, max_retries
            );
            project.fail(message);
            true
        } else {
            project.should_retry = false;
            warn!("Project {}: {}, giving up", project.id, conflict);
            let message = format!("{}; giving up after {} retries", conflict, max_retries);
            project.fail(message);
            false
        }
    }

    fn spawn_retry(&self, slot: Arc<ProjectSlot>, run_id: u64) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.retry_after_conflict(slot, run_id).await;
        });
    }

    async fn retry_after_conflict(&self, slot: Arc<ProjectSlot>, run_id: u64) {
        let id = slot.id;
        let _op = slot.op.lock().await;
        if self.is_shutting_down() || !self.inner.registry.contains(id).await {
            return;
        }

        let current_port = {
            let mut project = slot.state.lock().await;
            // A user start or stop in the meantime supersedes the retry
            if project.run_id != run_id || !project.should_retry {
                debug!("Conflict retry for project {} is no longer wanted", id);
                return;
            }
            project.should_retry = false;
            project.port
        };

        if let Err(e) = self.stop_locked(&slot, HandOff::Suppress).await {
            warn!("Conflict retry for project {} could not stop the old process: {}", id, e);
            return;
        }

        let next = tokio::task::spawn_blocking(move || {
            next_available_port(current_port, PORT_SEARCH_ATTEMPTS)
        })
        .await
        .ok()
        .flatten();

        let Some(next) = next else {
            let message = format!(
                "No free port found within {} ports after {}",
                PORT_SEARCH_ATTEMPTS, current_port
            );
            slot.state.lock().await.fail(message);
            self.changed(id, vec![ProjectField::Status]);
            return;
        };

        {
            let mut project = slot.state.lock().await;
            project.port = next;
            project.log(LogType::Info, format!("Retrying on port {}", next));
        }
        self.changed(id, vec![ProjectField::Port]);
        self.persist().await;

        if let Err(e) = self.start_locked(&slot, StartMode::Retry).await {
            warn!("Conflict retry for project {} failed: {}", id, e);
        }
    }

    // === RECONCILIATION ===

    /// One full pass: liveness of external projects, then discovery and upsert
    pub async fn reconcile(&self) -> ReconcileReport {
        let _pass = self.inner.reconcile_lock.lock().await;
        let mut report = ReconcileReport::default();

        self.liveness_pass(&mut report).await;

        let ignore: HashSet<u32> = self.inner.registry.internal_pids().await.into_iter().collect();
        let servers = self.inner.discovery.scan(&ignore).await;
        self.upsert_pass(servers, &mut report).await;

        if report != ReconcileReport::default() {
            debug!("Reconciliation: {:?}", report);
        }
        report
    }

    /// Check that every external project still has a live backing process
    pub async fn check_liveness(&self) -> ReconcileReport {
        let _pass = self.inner.reconcile_lock.lock().await;
        let mut report = ReconcileReport::default();
        self.liveness_pass(&mut report).await;
        report
    }

    /// Reconcile the given scan results into the registry
    pub async fn apply_discovered(&self, servers: Vec<DiscoveredServer>) -> ReconcileReport {
        let _pass = self.inner.reconcile_lock.lock().await;
        let mut report = ReconcileReport::default();
        self.upsert_pass(servers, &mut report).await;
        report
    }

    async fn liveness_pass(&self, report: &mut ReconcileReport) {
        for slot in self.inner.registry.slots().await {
            let Ok(_op) = slot.op.try_lock() else {
                report.skipped += 1;
                continue;
            };

            let (pid, port) = {
                let project = slot.state.lock().await;
                if !project.is_external_process {
                    continue;
                }
                (project.external_process_id, project.port)
            };

            let alive = match pid {
                Some(pid) => tokio::task::spawn_blocking(move || is_process_alive(pid))
                    .await
                    .unwrap_or(true),
                None => self.inner.http.is_alive(port).await,
            };
            if alive {
                continue;
            }

            let reason = match pid {
                Some(pid) => format!("External dev server (PID {}) on port {} is gone", pid, port),
                None => format!("External dev server on port {} stopped responding", port),
            };
            if self.retire_external(&slot, reason).await {
                report.removed += 1;
            } else {
                report.updated += 1;
            }
        }
    }

    async fn upsert_pass(&self, servers: Vec<DiscoveredServer>, report: &mut ReconcileReport) {
        for server in servers {
            let identity = resolve_identity(&server);
            let views = self.inner.registry.views().await;
            let plan = plan_upsert(&views, server.port, identity.path.as_deref());

            match plan.action {
                UpsertAction::Skip => {
                    debug!(
                        "Skipping discovered server on port {} (PID {})",
                        server.port, server.pid
                    );
                    report.skipped += 1;
                    continue;
                }
                UpsertAction::Create => {
                    self.create_discovered(&server, &identity).await;
                    report.added += 1;
                }
                UpsertAction::UpdateByPath(id) | UpsertAction::UpdateByPort(id) => {
                    if self.adopt_discovered(id, &server, &identity).await {
                        report.updated += 1;
                    }
                }
            }

            for displaced in plan.displaced {
                let Some(slot) = self.inner.registry.get(displaced).await else {
                    continue;
                };
                let Ok(_op) = slot.op.try_lock() else {
                    report.skipped += 1;
                    continue;
                };
                let reason = format!(
                    "Port {} is now served by PID {}",
                    server.port, server.pid
                );
                if self.retire_external(&slot, reason).await {
                    report.removed += 1;
                } else {
                    report.updated += 1;
                }
            }
        }
    }

    async fn type_override_for(&self, path: Option<&Path>) -> Option<ProjectType> {
        let path = path?;
        self.inner.type_overrides.read().await.get(path).copied()
    }

    async fn create_discovered(&self, server: &DiscoveredServer, identity: &ResolvedIdentity) {
        let hint = ProjectDetector::type_hint_from_command(&server.command_line);
        let user_override = self.type_override_for(identity.path.as_deref()).await;
        let project_type = match &identity.path {
            Some(path) => ProjectDetector::detect_project_type(path, user_override, hint),
            None => hint,
        };

        let mut project = Project::new(
            identity.name.clone(),
            identity.path.clone(),
            server.port,
            project_type,
            ProjectOrigin::Discovered,
            self.inner.config.retention,
        );
        project.type_overridden = user_override.is_some();
        project.mark_external(server.pid);
        project.log(
            LogType::Info,
            format!(
                "Discovered external dev server (PID {}): {}",
                server.pid, server.command_line
            ),
        );
        let id = project.id;

        self.inner.registry.insert(project).await;
        info!(
            "Discovered {} on port {} (PID {})",
            identity.name, server.port, server.pid
        );
        self.emit(SupervisorEvent::ProjectAdded { id });
    }

    /// Update an existing project in place from a discovered server.
    /// Returns false when the project was busy or nothing changed.
    async fn adopt_discovered(
        &self,
        id: ProjectId,
        server: &DiscoveredServer,
        identity: &ResolvedIdentity,
    ) -> bool {
        let Some(slot) = self.inner.registry.get(id).await else {
            return false;
        };
        let Ok(_op) = slot.op.try_lock() else {
            return false;
        };

        let user_override = self.type_override_for(identity.path.as_deref()).await;
        let hint = ProjectDetector::type_hint_from_command(&server.command_line);
        let mut fields = Vec::new();

        let origin = {
            let mut project = slot.state.lock().await;
            if project.has_internal_process() {
                return false;
            }

            let attached = project.is_external_process
                && project.external_process_id == Some(server.pid)
                && project.status == ProjectStatus::Running;
            if !attached {
                project.mark_external(server.pid);
                project.log(
                    LogType::Info,
                    format!(
                        "Attached to external dev server (PID {}) on port {}",
                        server.pid, server.port
                    ),
                );
                fields.extend([ProjectField::Status, ProjectField::External]);
            }

            if project.port != server.port {
                project.port = server.port;
                fields.push(ProjectField::Port);
            }

            if project.path.is_none() {
                if let Some(path) = &identity.path {
                    project.path = Some(path.clone());
                    fields.push(ProjectField::Path);
                    if !project.type_overridden {
                        project.project_type =
                            ProjectDetector::detect_project_type(path, user_override, hint);
                        project.type_overridden = user_override.is_some();
                        fields.push(ProjectField::Type);
                    }
                }
            }

            if project.has_placeholder_name() && project.name != identity.name {
                project.name = identity.name.clone();
                fields.push(ProjectField::Name);
            }
            project.origin
        };

        if fields.is_empty() {
            return false;
        }
        debug!("Updated project {} from discovery: {:?}", id, fields);
        self.changed(id, fields);
        if origin == ProjectOrigin::User {
            self.persist().await;
        }
        true
    }

    /// The external process behind a project is gone. Discovered projects are
    /// removed; user projects fall back to Stopped. Returns true if removed.
    async fn retire_external(&self, slot: &Arc<ProjectSlot>, reason: String) -> bool {
        let id = slot.id;
        let remove = {
            let mut project = slot.state.lock().await;
            project.clear_external();
            project.status = ProjectStatus::Stopped;
            project.log(LogType::Warning, reason);
            project.origin == ProjectOrigin::Discovered
        };

        if remove {
            self.inner.registry.remove(id).await;
            info!("Removed orphaned project {}", id);
            self.emit(SupervisorEvent::ProjectRemoved { id });
        } else {
            self.changed(id, vec![ProjectField::Status, ProjectField::External]);
        }
        remove
    }

    async fn start_background(&self) {
        let mut background = self.inner.background.lock().await;
        if background.is_some() {
            debug!("Background reconciliation already running");
            return;
        }

        let period = self.inner.config.discovery_interval;
        info!(
            "Starting background reconciliation (interval: {} seconds)",
            period.as_secs()
        );

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let report = Supervisor { inner }.reconcile().await;
                        debug!(
                            "Reconciliation pass: +{} ~{} -{}",
                            report.added, report.updated, report.removed
                        );
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Background reconciliation stopped");
        });

        *background = Some(Background { shutdown, task });
    }

    // === PERSISTENCE ===

    async fn load_state(&self) -> SupervisorResult<usize> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let state = store.load()?;
        *self.inner.type_overrides.write().await = state.type_overrides.clone();

        let mut loaded = 0;
        for persisted in state.projects {
            if self.inner.registry.find_by_path(&persisted.path).await.is_some() {
                warn!("Skipping duplicate stored project at {:?}", persisted.path);
                continue;
            }

            let user_override = state.type_overrides.get(&persisted.path).copied();
            let mut project = Project::new(
                persisted.name,
                Some(persisted.path),
                persisted.port,
                user_override.unwrap_or(persisted.project_type),
                ProjectOrigin::User,
                self.inner.config.retention,
            );
            project.type_overridden = user_override.is_some();
            let id = project.id;

            self.inner.registry.insert(project).await;
            self.emit(SupervisorEvent::ProjectAdded { id });
            loaded += 1;
        }
        Ok(loaded)
    }

    async fn persist(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let _guard = self.inner.persist_lock.lock().await;

        let mut state = PersistedState {
            type_overrides: self.inner.type_overrides.read().await.clone(),
            ..PersistedState::default()
        };
        for slot in self.inner.registry.slots().await {
            let project = slot.state.lock().await;
            if project.origin != ProjectOrigin::User {
                continue;
            }
            if let Some(path) = &project.path {
                state.projects.push(PersistedProject {
                    name: project.name.clone(),
                    path: path.clone(),
                    port: project.port,
                    project_type: project.project_type,
                });
            }
        }

        if let Err(e) = store.save(&state) {
            warn!("Failed to persist projects: {}", e);
        }
    }

    // === HELPERS ===

    async fn slot(&self, id: ProjectId) -> SupervisorResult<Arc<ProjectSlot>> {
        self.inner
            .registry
            .get(id)
            .await
            .ok_or(SupervisorError::ProjectNotFound { id })
    }

    async fn fail(&self, slot: &Arc<ProjectSlot>, err: &SupervisorError) {
        slot.state.lock().await.fail(err.to_string());
        self.changed(slot.id, vec![ProjectField::Status]);
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn changed(&self, id: ProjectId, fields: Vec<ProjectField>) {
        if !fields.is_empty() {
            self.emit(SupervisorEvent::ProjectChanged { id, fields });
        }
    }
}

fn project_name_from_path(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
