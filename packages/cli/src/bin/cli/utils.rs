// ABOUTME: Shared formatting helpers for CLI output
// ABOUTME: Status and log colouring, project tables and the engine configuration

use chrono::Local;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use metrodeck_supervisor::{LogEntry, LogType, ProjectSnapshot, ProjectStatus, SupervisorConfig};
use std::path::Path;

/// Environment-driven configuration without persistence or the background loop.
/// One-shot commands must not rewrite the user's saved registry.
pub fn one_shot_config() -> SupervisorConfig {
    SupervisorConfig {
        discovery_enabled: false,
        state_path: None,
        ..SupervisorConfig::from_env()
    }
}

pub fn status_label(status: ProjectStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ProjectStatus::Running => text.green(),
        ProjectStatus::Starting | ProjectStatus::ResolvingPortConflict => text.yellow(),
        ProjectStatus::Error => text.red(),
        ProjectStatus::Stopped => text.dimmed(),
    }
}

pub fn format_log_entry(entry: &LogEntry) -> String {
    let time = entry.timestamp.with_timezone(&Local).format("%H:%M:%S");
    let message = match entry.log_type {
        LogType::Error => entry.message.red(),
        LogType::Warning => entry.message.yellow(),
        LogType::Success => entry.message.green(),
        LogType::Info => entry.message.normal(),
    };
    format!("{} {}", time.to_string().dimmed(), message)
}

/// Read position in one project's log
#[derive(Debug, Default)]
pub struct LogCursor {
    last_seq: u64,
}

impl LogCursor {
    pub fn position(&self) -> u64 {
        self.last_seq
    }

    /// Keep the entries not seen yet and move past them
    pub fn take_new(&mut self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        let fresh: Vec<LogEntry> = entries
            .into_iter()
            .filter(|entry| entry.seq > self.last_seq)
            .collect();
        if let Some(last) = fresh.last() {
            self.last_seq = last.seq;
        }
        fresh
    }
}

pub fn path_label(path: Option<&Path>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "—".to_string(),
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", kept)
}

pub fn projects_table(projects: &[ProjectSnapshot]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["Port", "PID", "Name", "Type", "Status", "Path"]);

    for project in projects {
        let pid = project
            .external_process_id
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "—".to_string());

        table.add_row(vec![
            project.port.to_string(),
            pid,
            truncate(&project.name, 30),
            project.project_type.display_name().to_string(),
            status_label(project.status).to_string(),
            path_label(project.path.as_deref()),
        ]);
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-project-name", 8), "a-very-…");
    }

    fn entry(seq: u64, message: &str) -> LogEntry {
        LogEntry {
            seq,
            ..LogEntry::info(message)
        }
    }

    #[test]
    fn test_log_cursor_skips_seen_entries() {
        let mut cursor = LogCursor::default();
        let first = cursor.take_new(vec![entry(1, "one"), entry(2, "two")]);
        assert_eq!(first.len(), 2);
        assert_eq!(cursor.position(), 2);

        // A later read that overlaps the first prints only the new tail
        let second = cursor.take_new(vec![entry(2, "two"), entry(3, "three"), entry(4, "four")]);
        let messages: Vec<_> = second.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["three", "four"]);
        assert_eq!(cursor.position(), 4);

        assert!(cursor.take_new(Vec::new()).is_empty());
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn test_path_label_for_unknown_path() {
        assert_eq!(path_label(None), "—");
        assert_eq!(path_label(Some(Path::new("/work/Foo"))), "/work/Foo");
    }
}
