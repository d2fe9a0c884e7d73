// ABOUTME: In-memory project registry with per-project exclusion
// ABOUTME: Each slot pairs an operation lock with the project's mutable state

use crate::discovery::{placeholder_name, ProjectView};
use crate::logs::{LogStore, RetentionPolicy};
use crate::runner::ProcessHandle;
use crate::types::{
    LogEntry, LogType, ProjectId, ProjectOrigin, ProjectSnapshot, ProjectStatus, ProjectType,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The unit of supervision
#[derive(Debug)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub path: Option<PathBuf>,
    pub port: u16,
    pub project_type: ProjectType,
    pub status: ProjectStatus,
    pub is_external_process: bool,
    pub external_process_id: Option<u32>,
    pub retry_count: u32,
    pub should_retry: bool,
    pub origin: ProjectOrigin,
    /// Set once the user picks a type; detection never changes it afterwards
    pub type_overridden: bool,
    pub logs: LogStore,
    pub(crate) process: Option<ProcessHandle>,
    /// Bumped whenever output wiring is detached so stale events are dropped
    pub(crate) run_id: u64,
    pub(crate) ingest_task: Option<JoinHandle<()>>,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        path: Option<PathBuf>,
        port: u16,
        project_type: ProjectType,
        origin: ProjectOrigin,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            path,
            port,
            project_type,
            status: ProjectStatus::Stopped,
            is_external_process: false,
            external_process_id: None,
            retry_count: 0,
            should_retry: false,
            origin,
            type_overridden: false,
            logs: LogStore::new(retention),
            process: None,
            run_id: 0,
            ingest_task: None,
        }
    }

    /// Starting or Running, backed by a live handle or an external PID
    pub fn is_running(&self) -> bool {
        matches!(self.status, ProjectStatus::Starting | ProjectStatus::Running)
            && (self.process.is_some() || self.external_process_id.is_some())
    }

    pub fn has_internal_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn internal_pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }

    pub fn has_placeholder_name(&self) -> bool {
        self.name == placeholder_name(self.port) || self.name.starts_with("Metro :")
    }

    pub fn path_matches(&self, path: &Path) -> bool {
        self.path.as_deref() == Some(path)
    }

    pub fn log(&mut self, log_type: LogType, message: impl Into<String>) {
        self.logs.push(LogEntry::new(message, log_type));
    }

    /// Enter Error with an explanation in the log
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = ProjectStatus::Error;
        self.log(LogType::Error, message);
    }

    /// Cut the output wiring of the current process. After this returns no
    /// further entries from that process reach the log store.
    pub(crate) fn detach_output(&mut self) {
        self.run_id += 1;
        if let Some(task) = self.ingest_task.take() {
            task.abort();
        }
    }

    pub(crate) fn mark_external(&mut self, pid: u32) {
        self.is_external_process = true;
        self.external_process_id = Some(pid);
        self.status = ProjectStatus::Running;
    }

    pub(crate) fn clear_external(&mut self) {
        self.is_external_process = false;
        self.external_process_id = None;
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            id: self.id,
            name: self.name.clone(),
            path: self.path.clone(),
            port: self.port,
            project_type: self.project_type,
            status: self.status,
            is_running: self.is_running(),
            is_external_process: self.is_external_process,
            external_process_id: self.external_process_id,
            retry_count: self.retry_count,
            should_retry: self.should_retry,
            origin: self.origin,
            type_overridden: self.type_overridden,
            log_count: self.logs.len(),
        }
    }

    pub fn view(&self) -> ProjectView {
        ProjectView {
            id: self.id,
            path: self.path.clone(),
            port: self.port,
            is_external: self.is_external_process,
            has_internal_process: self.has_internal_process(),
        }
    }
}

/// A project plus its exclusion lock.
///
/// `op` is held for the whole of a user operation or a reconciliation
/// mutation; `state` only for short, non-blocking updates. Acquire `op`
/// before `state`, never the other way round.
#[derive(Debug)]
pub struct ProjectSlot {
    pub id: ProjectId,
    pub(crate) op: Mutex<()>,
    pub(crate) state: Mutex<Project>,
}

impl ProjectSlot {
    fn new(project: Project) -> Self {
        Self {
            id: project.id,
            op: Mutex::new(()),
            state: Mutex::new(project),
        }
    }

    pub async fn snapshot(&self) -> ProjectSnapshot {
        self.state.lock().await.snapshot()
    }
}

/// Insertion-ordered collection of project slots
#[derive(Debug, Default)]
pub struct ProjectRegistry {
    slots: RwLock<Vec<Arc<ProjectSlot>>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, project: Project) -> Arc<ProjectSlot> {
        let slot = Arc::new(ProjectSlot::new(project));
        self.slots.write().await.push(slot.clone());
        slot
    }

    pub async fn get(&self, id: ProjectId) -> Option<Arc<ProjectSlot>> {
        self.slots
            .read()
            .await
            .iter()
            .find(|slot| slot.id == id)
            .cloned()
    }

    pub async fn remove(&self, id: ProjectId) -> Option<Arc<ProjectSlot>> {
        let mut slots = self.slots.write().await;
        let index = slots.iter().position(|slot| slot.id == id)?;
        Some(slots.remove(index))
    }

    pub async fn contains(&self, id: ProjectId) -> bool {
        self.get(id).await.is_some()
    }

    /// Current slots. The registry lock is released before returning.
    pub async fn slots(&self) -> Vec<Arc<ProjectSlot>> {
        self.slots.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub async fn snapshots(&self) -> Vec<ProjectSnapshot> {
        let mut snapshots = Vec::new();
        for slot in self.slots().await {
            snapshots.push(slot.snapshot().await);
        }
        snapshots
    }

    pub async fn views(&self) -> Vec<ProjectView> {
        let mut views = Vec::new();
        for slot in self.slots().await {
            views.push(slot.state.lock().await.view());
        }
        views
    }

    pub async fn find_by_path(&self, path: &Path) -> Option<Arc<ProjectSlot>> {
        for slot in self.slots().await {
            if slot.state.lock().await.path_matches(path) {
                return Some(slot);
            }
        }
        None
    }

    /// Slot whose project owns `pid`, internally or as its external process
    pub async fn find_by_pid(&self, pid: u32) -> Option<Arc<ProjectSlot>> {
        for slot in self.slots().await {
            let project = slot.state.lock().await;
            if project.internal_pid() == Some(pid) || project.external_process_id == Some(pid) {
                drop(project);
                return Some(slot);
            }
        }
        None
    }

    /// PIDs of every process the supervisor spawned and still holds
    pub async fn internal_pids(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        for slot in self.slots().await {
            if let Some(pid) = slot.state.lock().await.internal_pid() {
                pids.push(pid);
            }
        }
        pids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(name: &str, path: Option<&str>, port: u16) -> Project {
        Project::new(
            name,
            path.map(PathBuf::from),
            port,
            ProjectType::Expo,
            ProjectOrigin::User,
            RetentionPolicy::default(),
        )
    }

    #[test]
    fn test_new_project_is_stopped() {
        let project = project("App", Some("/p/app"), 8081);
        assert_eq!(project.status, ProjectStatus::Stopped);
        assert!(!project.is_running());
        assert!(!project.is_external_process);
        assert_eq!(project.snapshot().log_count, 0);
    }

    #[test]
    fn test_external_running_counts_as_running() {
        let mut project = project("Metro :8085", None, 8085);
        assert!(project.has_placeholder_name());
        project.mark_external(4321);
        assert!(project.is_running());
        assert_eq!(project.snapshot().external_process_id, Some(4321));

        project.clear_external();
        assert!(!project.is_running());
    }

    #[test]
    fn test_fail_logs_reason() {
        let mut project = project("App", Some("/p/app"), 8081);
        project.fail("Port 8081 is still in use");
        assert_eq!(project.status, ProjectStatus::Error);
        let last = project.logs.last().unwrap();
        assert_eq!(last.log_type, LogType::Error);
        assert_eq!(last.message, "Port 8081 is still in use");
    }

    #[test]
    fn test_detach_bumps_run_id() {
        let mut project = project("App", Some("/p/app"), 8081);
        let before = project.run_id;
        project.detach_output();
        project.detach_output();
        assert_eq!(project.run_id, before + 2);
    }

    #[tokio::test]
    async fn test_registry_keeps_insertion_order() {
        let registry = ProjectRegistry::new();
        let a = registry.insert(project("A", Some("/p/a"), 8081)).await;
        let b = registry.insert(project("B", Some("/p/b"), 8082)).await;

        let names: Vec<String> = registry
            .snapshots()
            .await
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["A", "B"]);

        assert_eq!(
            registry.find_by_path(Path::new("/p/b")).await.unwrap().id,
            b.id
        );
        assert!(registry.remove(a.id).await.is_some());
        assert!(registry.remove(a.id).await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_find_by_external_pid() {
        let registry = ProjectRegistry::new();
        let mut external = project("Metro :8085", None, 8085);
        external.mark_external(4321);
        let slot = registry.insert(external).await;

        assert_eq!(registry.find_by_pid(4321).await.unwrap().id, slot.id);
        assert!(registry.find_by_pid(1).await.is_none());
        assert!(registry.internal_pids().await.is_empty());
    }
}
