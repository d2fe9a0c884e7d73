// ABOUTME: JSON file persistence for user projects and type overrides
// ABOUTME: Loading skips malformed entries; saving writes a temp file and renames it

use crate::types::{ProjectType, SupervisorError, SupervisorResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STATE_VERSION: u32 = 1;

/// A user project as written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedProject {
    pub name: String,
    pub path: PathBuf,
    pub port: u16,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
}

/// Everything that survives a restart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub projects: Vec<PersistedProject>,
    /// User-chosen types keyed by project path
    pub type_overrides: BTreeMap<PathBuf, ProjectType>,
}

#[derive(Serialize)]
struct StateFile<'a> {
    version: u32,
    projects: &'a [PersistedProject],
    type_overrides: &'a BTreeMap<PathBuf, ProjectType>,
}

/// Registry file on disk
#[derive(Debug, Clone)]
pub struct ProjectStore {
    path: PathBuf,
}

impl ProjectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted state. A missing file is an empty state; a file that is
    /// not JSON at all is set aside as `.bak` and treated as empty.
    pub fn load(&self) -> SupervisorResult<PersistedState> {
        if !self.path.exists() {
            debug!("Project store does not exist yet at {:?}", self.path);
            return Ok(PersistedState::default());
        }

        let content = fs::read_to_string(&self.path)?;
        let root: Value = match serde_json::from_str(&content) {
            Ok(root) => root,
            Err(e) => {
                let backup = self.path.with_extension("json.bak");
                warn!(
                    "Project store {:?} is unreadable ({}), moving it to {:?}",
                    self.path, e, backup
                );
                fs::rename(&self.path, &backup)?;
                return Ok(PersistedState::default());
            }
        };

        let state = parse_state(&root);
        info!(
            "Loaded {} projects and {} type overrides from {:?}",
            state.projects.len(),
            state.type_overrides.len(),
            self.path
        );
        Ok(state)
    }

    pub fn save(&self, state: &PersistedState) -> SupervisorResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = StateFile {
            version: STATE_VERSION,
            projects: &state.projects,
            type_overrides: &state.type_overrides,
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            SupervisorError::Storage(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!("Saved {} projects to {:?}", state.projects.len(), self.path);
        Ok(())
    }
}

fn parse_state(root: &Value) -> PersistedState {
    let mut state = PersistedState::default();

    if let Some(version) = root.get("version").and_then(Value::as_u64) {
        if version != u64::from(STATE_VERSION) {
            warn!("Project store version {} is newer than supported, reading what we can", version);
        }
    }

    if let Some(projects) = root.get("projects").and_then(Value::as_array) {
        for (index, entry) in projects.iter().enumerate() {
            match serde_json::from_value::<PersistedProject>(entry.clone()) {
                Ok(project) if project.path.is_absolute() => state.projects.push(project),
                Ok(project) => warn!(
                    "Skipping stored project {} with relative path {:?}",
                    index, project.path
                ),
                Err(e) => warn!("Skipping malformed stored project {}: {}", index, e),
            }
        }
    }

    if let Some(overrides) = root.get("type_overrides").and_then(Value::as_object) {
        for (path, value) in overrides {
            match serde_json::from_value::<ProjectType>(value.clone()) {
                Ok(project_type) => {
                    state.type_overrides.insert(PathBuf::from(path), project_type);
                }
                Err(e) => warn!("Skipping malformed type override for {}: {}", path, e),
            }
        }
    }

    state
}
