use crate::runner::{build_child_env, LaunchCommand};
use crate::types::{ProjectType, SupervisorError, SupervisorResult};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Single-line file at the project root that pins the project type
pub const TYPE_MARKER_FILE: &str = ".metrodeck-type";

/// Type used when nothing else identifies a project
pub const DEFAULT_PROJECT_TYPE: ProjectType = ProjectType::ReactNativeCli;

const EXPO_PACKAGE: &str = "expo";
const REACT_NATIVE_PACKAGE: &str = "react-native";

const EXPO_CONFIG_FILES: &[&str] = &["app.config.js", "app.config.ts", "app.config.mjs", "expo.json"];
const REACT_NATIVE_CONFIG_FILES: &[&str] = &[
    "metro.config.js",
    "react-native.config.js",
    "android/build.gradle",
];

/// Expo caps bundler workers to keep memory in check
const EXPO_MAX_WORKERS: &str = "2";

/// Project detector for validating project roots and determining their dev server flavour
pub struct ProjectDetector;

impl ProjectDetector {
    /// Read `package.json`. Missing or malformed manifests are treated as absent.
    pub fn read_manifest(project_root: &Path) -> Option<Value> {
        let manifest_path = project_root.join("package.json");
        let content = fs::read_to_string(&manifest_path).ok()?;

        match serde_json::from_str::<Value>(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                debug!("Ignoring malformed {}: {}", manifest_path.display(), e);
                None
            }
        }
    }

    fn has_dependency(manifest: &Value, name: &str) -> bool {
        ["dependencies", "devDependencies"].iter().any(|section| {
            manifest
                .get(section)
                .and_then(|deps| deps.as_object())
                .is_some_and(|deps| deps.contains_key(name))
        })
    }

    fn scripts_mention(manifest: &Value, name: &str) -> bool {
        manifest
            .get("scripts")
            .and_then(|scripts| scripts.as_object())
            .is_some_and(|scripts| {
                scripts
                    .values()
                    .filter_map(|script| script.as_str())
                    .any(|script| script.contains(name))
            })
    }

    fn names_framework(manifest: &Value, name: &str) -> bool {
        Self::has_dependency(manifest, name) || Self::scripts_mention(manifest, name)
    }

    /// True when the manifest names Expo or React Native as a dependency,
    /// dev-dependency or inside a script
    pub fn is_valid_project_path(project_root: &Path) -> bool {
        match Self::read_manifest(project_root) {
            Some(manifest) => {
                Self::names_framework(&manifest, EXPO_PACKAGE)
                    || Self::names_framework(&manifest, REACT_NATIVE_PACKAGE)
            }
            None => false,
        }
    }

    /// Hard gate before starting a project
    pub fn validate_project_path(project_root: &Path) -> SupervisorResult<()> {
        let invalid = |reason: &str| SupervisorError::InvalidPath {
            path: project_root.to_path_buf(),
            reason: reason.to_string(),
        };

        if !project_root.exists() {
            return Err(invalid("path does not exist"));
        }
        if !project_root.is_dir() {
            return Err(invalid("path is not a directory"));
        }
        if !Self::is_valid_project_path(project_root) {
            return Err(invalid(
                "package.json does not reference expo or react-native",
            ));
        }
        Ok(())
    }

    /// Type named by the marker file, if present and recognised
    pub fn read_type_marker(project_root: &Path) -> Option<ProjectType> {
        let content = fs::read_to_string(project_root.join(TYPE_MARKER_FILE)).ok()?;
        let token = content.lines().next().unwrap_or_default();
        let project_type = ProjectType::from_token(token);
        if project_type.is_none() {
            debug!(
                "Ignoring unrecognised type marker '{}' in {}",
                token.trim(),
                project_root.display()
            );
        }
        project_type
    }

    pub fn write_type_marker(project_root: &Path, project_type: ProjectType) -> SupervisorResult<()> {
        fs::write(
            project_root.join(TYPE_MARKER_FILE),
            format!("{}\n", project_type.as_str()),
        )?;
        Ok(())
    }

    /// Type implied by config files and dependencies. Expo signatures are
    /// checked first since Expo projects also depend on react-native.
    pub fn detect_signature_type(project_root: &Path) -> Option<ProjectType> {
        let manifest = Self::read_manifest(project_root);

        let expo_dependency = manifest
            .as_ref()
            .is_some_and(|m| Self::has_dependency(m, EXPO_PACKAGE));
        if expo_dependency
            || Self::app_json_has_expo_key(project_root)
            || Self::any_file_exists(project_root, EXPO_CONFIG_FILES)
        {
            return Some(ProjectType::Expo);
        }

        let react_native_dependency = manifest
            .as_ref()
            .is_some_and(|m| Self::has_dependency(m, REACT_NATIVE_PACKAGE));
        if react_native_dependency || Self::any_file_exists(project_root, REACT_NATIVE_CONFIG_FILES)
        {
            return Some(ProjectType::ReactNativeCli);
        }

        None
    }

    fn app_json_has_expo_key(project_root: &Path) -> bool {
        fs::read_to_string(project_root.join("app.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<Value>(&content).ok())
            .is_some_and(|app| app.get("expo").is_some())
    }

    fn any_file_exists(project_root: &Path, files: &[&str]) -> bool {
        files.iter().any(|file| project_root.join(file).exists())
    }

    /// Resolve a project's type in priority order: user override, marker file,
    /// signatures, then `fallback`
    pub fn detect_project_type(
        project_root: &Path,
        user_override: Option<ProjectType>,
        fallback: ProjectType,
    ) -> ProjectType {
        if let Some(project_type) = user_override {
            return project_type;
        }
        if let Some(project_type) = Self::read_type_marker(project_root) {
            return project_type;
        }
        Self::detect_signature_type(project_root).unwrap_or(fallback)
    }

    /// Fallback type for a discovered process, judged by its command line
    pub fn type_hint_from_command(command_line: &str) -> ProjectType {
        if command_line.to_lowercase().contains(EXPO_PACKAGE) {
            ProjectType::Expo
        } else {
            ProjectType::ReactNativeCli
        }
    }

    fn local_binary(project_root: &Path, name: &str) -> PathBuf {
        project_root.join("node_modules").join(".bin").join(name)
    }

    /// Launch command for the project's dev server, using the project's own
    /// `node_modules/.bin` binary
    pub fn launch_command(
        project_type: ProjectType,
        project_root: &Path,
        port: u16,
    ) -> SupervisorResult<LaunchCommand> {
        let port = port.to_string();
        let (binary, args): (&str, Vec<&str>) = match project_type {
            ProjectType::Expo => (
                EXPO_PACKAGE,
                vec!["start", "--port", port.as_str(), "--max-workers", EXPO_MAX_WORKERS],
            ),
            ProjectType::ReactNativeCli => (REACT_NATIVE_PACKAGE, vec!["start", "--port", port.as_str()]),
        };

        let program = Self::local_binary(project_root, binary);
        let command = LaunchCommand::new(&program, project_root).args(args);
        if !program.exists() {
            warn!("Dev server binary missing: {}", program.display());
            return Err(SupervisorError::SpawnFailure {
                command: command.display(),
                reason: format!(
                    "{} not found; run your package manager's install first",
                    program.display()
                ),
            });
        }

        Ok(command.env(build_child_env(project_root)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project_with_manifest(manifest: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("package.json"), manifest).unwrap();
        dir
    }

    #[test]
    fn test_react_native_project() {
        let dir = project_with_manifest(r#"{"dependencies": {"react-native": "^0.74"}}"#);

        assert!(ProjectDetector::is_valid_project_path(dir.path()));
        assert_eq!(
            ProjectDetector::detect_project_type(dir.path(), None, DEFAULT_PROJECT_TYPE),
            ProjectType::ReactNativeCli
        );
    }

    #[test]
    fn test_expo_dependency_wins_over_react_native() {
        let dir = project_with_manifest(
            r#"{"dependencies": {"expo": "~51.0.0", "react-native": "0.74.1"}}"#,
        );
        assert_eq!(
            ProjectDetector::detect_signature_type(dir.path()),
            Some(ProjectType::Expo)
        );
    }

    #[test]
    fn test_expo_from_app_json_and_config_files() {
        let dir = project_with_manifest(r#"{"scripts": {"start": "react-native start"}}"#);
        fs::write(dir.path().join("app.json"), r#"{"expo": {"name": "demo"}}"#).unwrap();
        assert_eq!(
            ProjectDetector::detect_signature_type(dir.path()),
            Some(ProjectType::Expo)
        );

        let dir = project_with_manifest(r#"{"devDependencies": {"react-native": "0.74.1"}}"#);
        fs::write(dir.path().join("app.config.ts"), "export default {}").unwrap();
        assert_eq!(
            ProjectDetector::detect_signature_type(dir.path()),
            Some(ProjectType::Expo)
        );
    }

    #[test]
    fn test_valid_via_script_only() {
        let dir = project_with_manifest(r#"{"scripts": {"start": "expo start"}}"#);
        assert!(ProjectDetector::is_valid_project_path(dir.path()));
        // Scripts alone are not a type signature
        assert_eq!(ProjectDetector::detect_signature_type(dir.path()), None);
    }

    #[test]
    fn test_malformed_or_missing_manifest_is_invalid() {
        let dir = project_with_manifest("{ not json");
        assert!(!ProjectDetector::is_valid_project_path(dir.path()));

        let empty = TempDir::new().unwrap();
        assert!(!ProjectDetector::is_valid_project_path(empty.path()));
        assert_eq!(
            ProjectDetector::detect_project_type(empty.path(), None, DEFAULT_PROJECT_TYPE),
            ProjectType::ReactNativeCli
        );
    }

    #[test]
    fn test_validate_project_path_reasons() {
        let missing = PathBuf::from("/definitely/not/here");
        match ProjectDetector::validate_project_path(&missing) {
            Err(SupervisorError::InvalidPath { reason, .. }) => {
                assert_eq!(reason, "path does not exist")
            }
            other => panic!("expected InvalidPath, got {:?}", other),
        }

        let dir = project_with_manifest(r#"{"dependencies": {"react": "18"}}"#);
        assert!(matches!(
            ProjectDetector::validate_project_path(dir.path()),
            Err(SupervisorError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_priority_override_then_marker_then_signature() {
        let dir = project_with_manifest(r#"{"dependencies": {"expo": "~51.0.0"}}"#);
        assert_eq!(
            ProjectDetector::detect_project_type(dir.path(), None, DEFAULT_PROJECT_TYPE),
            ProjectType::Expo
        );

        fs::write(dir.path().join(TYPE_MARKER_FILE), "CLI\n").unwrap();
        assert_eq!(
            ProjectDetector::detect_project_type(dir.path(), None, DEFAULT_PROJECT_TYPE),
            ProjectType::ReactNativeCli
        );

        assert_eq!(
            ProjectDetector::detect_project_type(
                dir.path(),
                Some(ProjectType::Expo),
                DEFAULT_PROJECT_TYPE
            ),
            ProjectType::Expo
        );
    }

    #[test]
    fn test_unrecognised_marker_is_ignored() {
        let dir = project_with_manifest(r#"{"dependencies": {"expo": "~51.0.0"}}"#);
        fs::write(dir.path().join(TYPE_MARKER_FILE), "flutter").unwrap();
        assert_eq!(ProjectDetector::read_type_marker(dir.path()), None);
        assert_eq!(
            ProjectDetector::detect_project_type(dir.path(), None, DEFAULT_PROJECT_TYPE),
            ProjectType::Expo
        );
    }

    #[test]
    fn test_write_type_marker_round_trips() {
        let dir = TempDir::new().unwrap();
        ProjectDetector::write_type_marker(dir.path(), ProjectType::Expo).unwrap();
        assert_eq!(
            ProjectDetector::read_type_marker(dir.path()),
            Some(ProjectType::Expo)
        );
    }

    #[test]
    fn test_type_hint_from_command() {
        assert_eq!(
            ProjectDetector::type_hint_from_command("node /a/node_modules/.bin/expo start"),
            ProjectType::Expo
        );
        assert_eq!(
            ProjectDetector::type_hint_from_command("node cli.js start --port 8085"),
            ProjectType::ReactNativeCli
        );
    }

    #[test]
    fn test_launch_command_templates() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("node_modules").join(".bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("expo"), "").unwrap();

        let cmd = ProjectDetector::launch_command(ProjectType::Expo, dir.path(), 8082).unwrap();
        assert_eq!(cmd.program, bin.join("expo"));
        assert_eq!(
            cmd.args,
            vec!["start", "--port", "8082", "--max-workers", "2"]
        );
        assert_eq!(cmd.working_dir, dir.path());

        match ProjectDetector::launch_command(ProjectType::ReactNativeCli, dir.path(), 8081) {
            Err(SupervisorError::SpawnFailure { command, reason }) => {
                assert!(command.ends_with("react-native start --port 8081"));
                assert!(reason.contains("node_modules"));
            }
            other => panic!("expected SpawnFailure, got {:?}", other),
        }
    }
}
