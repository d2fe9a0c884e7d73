// ABOUTME: Log ingestion pipeline for dev server output
// ABOUTME: ANSI stripping, line reassembly, filtering, classification, retention and signal detection

use crate::runner::StreamKind;
use crate::types::{LogEntry, LogType};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[mK]").expect("ANSI escape pattern is valid"));

/// Lines containing any of these are always kept
const IMPORTANT_MARKERS: &[&str] = &["error", "warning", "failed", "exception", "ready"];

/// Short lines containing any of these are noise unless important
const LOW_VALUE_PATTERNS: &[&str] = &[
    "log",
    "metro ",
    "loading dependency graph",
    "running",
    "bundling",
    "fast refresh",
    "reloading",
    "hmr",
];

const LOW_VALUE_MAX_LEN: usize = 50;
const MIN_LINE_LEN: usize = 3;

const ERROR_MARKERS: &[&str] = &["error", "fail", "eaddrinuse"];
const WARNING_MARKERS: &[&str] = &["warn", "deprecated"];
const SUCCESS_MARKERS: &[&str] = &["ready", "success", "complete"];

/// Remove `ESC [ <params> m` and `ESC [ <params> K` sequences
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Whether a trimmed line survives the noise filter.
///
/// Importance is checked first: a line mentioning an error, warning, failure,
/// exception or readiness is never dropped.
pub fn should_keep(line: &str) -> bool {
    if line.chars().count() < MIN_LINE_LEN {
        return false;
    }

    let lower = line.to_lowercase();
    if contains_any(&lower, IMPORTANT_MARKERS) {
        return true;
    }

    !(contains_any(&lower, LOW_VALUE_PATTERNS) && line.chars().count() < LOW_VALUE_MAX_LEN)
}

/// Classify a line. First match wins: Error, then Warning, then Success, else Info.
pub fn classify(line: &str) -> LogType {
    let lower = line.to_lowercase();
    if contains_any(&lower, ERROR_MARKERS) {
        LogType::Error
    } else if contains_any(&lower, WARNING_MARKERS) {
        LogType::Warning
    } else if contains_any(&lower, SUCCESS_MARKERS) {
        LogType::Success
    } else {
        LogType::Info
    }
}

/// Run one complete raw line through strip, trim, filter and classify
pub fn process_line(raw: &str) -> Option<LogEntry> {
    let stripped = strip_ansi(raw);
    let line = stripped.trim();
    if !should_keep(line) {
        return None;
    }
    Some(LogEntry::new(line, classify(line)))
}

/// State change implied by dev server output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSignal {
    /// The bundler reports it is serving
    Ready,
    /// The port is taken by someone else
    Conflict,
}

fn is_ready_text(lower: &str) -> bool {
    let names_server = contains_any(lower, &["metro", "expo", "development server"]);
    let reports_ready = contains_any(lower, &["waiting", "ready", "listening"]);
    (names_server && reports_ready)
        || lower.contains("waiting on http://localhost")
        || lower.contains("bundler is ready")
}

/// Scan raw text for readiness or port-conflict markers.
///
/// Runs on the unfiltered text. The pipeline applies it to each chunk and to
/// each line the chunk completes, so a marker split across reads is still
/// seen once its line ends. The `port` + `use` rule is a broad heuristic
/// kept for behavioural parity; it can misfire on ordinary lines that mention
/// a port, which in turn feeds the conflict retry budget.
pub fn detect_signal(chunk: &str) -> Option<OutputSignal> {
    let lower = strip_ansi(chunk).to_lowercase();

    if lower.contains("eaddrinuse") {
        return Some(OutputSignal::Conflict);
    }

    if is_ready_text(&lower) {
        return Some(OutputSignal::Ready);
    }

    if lower.contains("port") && lower.contains("use") {
        return Some(OutputSignal::Conflict);
    }

    None
}

/// Reassembles lines split across output chunks
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    /// Append a chunk and return every line it completed
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);

        let Some(last_newline) = self.partial.rfind('\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect()
    }

    /// Take whatever incomplete line is buffered
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

/// Result of feeding one chunk through the pipeline
#[derive(Debug, Default)]
pub struct Ingested {
    pub entries: Vec<LogEntry>,
    pub signal: Option<OutputSignal>,
}

/// Per-process pipeline. Each stream keeps its own partial line so stdout and
/// stderr never splice into each other.
#[derive(Debug, Default)]
pub struct LogPipeline {
    stdout: LineAssembler,
    stderr: LineAssembler,
}

impl LogPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, stream: StreamKind, chunk: &str) -> Ingested {
        let assembler = match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        let lines = assembler.push(chunk);

        let signal = detect_signal(chunk)
            .or_else(|| lines.iter().find_map(|line| detect_signal(line)));
        let entries = lines.iter().filter_map(|line| process_line(line)).collect();

        Ingested { entries, signal }
    }

    /// Flush trailing partial lines once the process has exited
    pub fn finish(&mut self) -> Vec<LogEntry> {
        [self.stdout.flush(), self.stderr.flush()]
            .into_iter()
            .flatten()
            .filter_map(|line| process_line(&line))
            .collect()
    }
}

/// Retention limits for a project's log store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Size the store is trimmed back to after every ingest
    pub soft_cap: usize,
    /// Hard bound, also enforced for the engine's own notes
    pub cleanup_threshold: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            soft_cap: crate::config::DEFAULT_LOG_SOFT_CAP,
            cleanup_threshold: crate::config::DEFAULT_LOG_CLEANUP_THRESHOLD,
        }
    }
}

/// Bounded, append-only log of one project.
///
/// Trimming leaves a single cleanup note at the tail. Later trims replace it
/// with one carrying the running total, so notes never pile up in the window.
#[derive(Debug, Clone)]
pub struct LogStore {
    entries: VecDeque<LogEntry>,
    policy: RetentionPolicy,
    next_seq: u64,
    /// Index of the live cleanup note and the total it reports
    cleanup_note: Option<(usize, usize)>,
}

impl LogStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            policy,
            next_seq: 1,
            cleanup_note: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    /// Sequence number the next stored entry will get
    pub fn sequence(&self) -> u64 {
        self.next_seq
    }

    fn record(&mut self, mut entry: LogEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(entry);
    }

    /// Append an engine note. Only the cleanup threshold bounds these.
    pub fn push(&mut self, entry: LogEntry) {
        self.record(entry);
        if self.entries.len() > self.policy.cleanup_threshold {
            self.trim_to_cap();
        }
    }

    /// Append ingested entries, then trim back to the soft cap if needed.
    /// Returns the number of entries stored, cleanup note included.
    pub fn append(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> usize {
        let mark = self.next_seq;
        for entry in entries {
            self.record(entry);
        }
        if self.next_seq == mark {
            return 0;
        }
        self.trim_to_cap();
        (self.next_seq - mark) as usize
    }

    fn retained_len(&self) -> usize {
        self.entries.len() - usize::from(self.cleanup_note.is_some())
    }

    /// Drop the oldest entries down to the soft cap and note how many went.
    /// Returns how many entries this call removed.
    pub fn trim_to_cap(&mut self) -> Option<usize> {
        if self.retained_len() <= self.policy.soft_cap {
            return None;
        }

        let mut total = 0;
        if let Some((index, reported)) = self.cleanup_note.take() {
            self.entries.remove(index);
            total = reported;
        }

        let purged = self.entries.len() - self.policy.soft_cap;
        self.entries.drain(..purged);
        total += purged;

        self.record(LogEntry::info(format!(
            "Log cleanup: removed {} older entries",
            total
        )));
        self.cleanup_note = Some((self.entries.len() - 1, total));
        Some(purged)
    }

    /// Remove every non-error entry. Returns how many were removed.
    pub fn force_cleanup(&mut self) -> usize {
        self.cleanup_note = None;
        let before = self.entries.len();
        self.entries.retain(|entry| entry.log_type == LogType::Error);
        before - self.entries.len()
    }

    /// Collapse runs of identical messages into their first entry, annotated
    /// with the run length. Returns how many entries were folded away.
    pub fn compress(&mut self) -> usize {
        self.cleanup_note = None;
        let before = self.entries.len();
        let mut compressed: VecDeque<LogEntry> = VecDeque::with_capacity(before);
        let mut run = 1usize;

        for entry in self.entries.drain(..) {
            let repeats = compressed
                .back()
                .is_some_and(|last| strip_repeat_suffix(&last.message, run) == entry.message);

            if repeats {
                if let Some(last) = compressed.back_mut() {
                    run += 1;
                    last.message = format!("{} (x{})", entry.message, run);
                    continue;
                }
            }
            run = 1;
            compressed.push_back(entry);
        }

        self.entries = compressed;
        before - self.entries.len()
    }

    /// Empty the store. Sequence numbers keep counting up.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cleanup_note = None;
    }

    /// Entries stored after the one numbered `seq`, oldest first
    pub fn after(&self, seq: u64) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.seq > seq)
            .cloned()
            .collect()
    }

    /// Entries newer than `since`, keeping only the newest `limit`
    pub fn query(&self, since: Option<DateTime<Utc>>, limit: Option<usize>) -> Vec<LogEntry> {
        let filtered: Vec<LogEntry> = self
            .entries
            .iter()
            .filter(|entry| since.map_or(true, |since| entry.timestamp > since))
            .cloned()
            .collect();

        match limit {
            Some(max_count) if filtered.len() > max_count => {
                filtered[filtered.len() - max_count..].to_vec()
            }
            _ => filtered,
        }
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

fn strip_repeat_suffix(message: &str, run: usize) -> &str {
    if run < 2 {
        return message;
    }
    let suffix = format!(" (x{})", run);
    message.strip_suffix(suffix.as_str()).unwrap_or(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[32mready\x1b[0m"), "ready");
        assert_eq!(strip_ansi("\x1b[2K\x1b[1Gdone"), "\x1b[1Gdone");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_short_lines_dropped() {
        assert!(process_line("ok").is_none());
        assert!(process_line("   \t ").is_none());
        assert!(process_line("abc").is_some());
    }

    #[test]
    fn test_low_value_lines_filtered() {
        assert!(process_line(" BUNDLING index.js ").is_none());
        assert!(process_line("Fast Refresh enabled").is_none());
        assert!(process_line("LOG  Hello from app").is_none());
    }

    #[test]
    fn test_important_lines_override_filter() {
        let entry = process_line("Bundling failed").unwrap();
        assert_eq!(entry.log_type, LogType::Error);

        let entry = process_line("Metro ready").unwrap();
        assert_eq!(entry.log_type, LogType::Success);
    }

    #[test]
    fn test_long_low_value_lines_kept() {
        let line = "Bundling index.js for the android platform with a long description";
        assert!(line.len() >= 50);
        let entry = process_line(line).unwrap();
        assert_eq!(entry.log_type, LogType::Info);
    }

    #[test]
    fn test_warning_line_kept_and_classified() {
        let entry = process_line("warning: something deprecated").unwrap();
        assert_eq!(entry.message, "warning: something deprecated");
        assert_eq!(entry.log_type, LogType::Warning);
    }

    #[test]
    fn test_classification_priority() {
        assert_eq!(classify("warning: bundler ready"), LogType::Warning);
        assert_eq!(classify("error while ready"), LogType::Error);
        assert_eq!(classify("listen EADDRINUSE :::8081"), LogType::Error);
        assert_eq!(classify("deprecated API, build complete"), LogType::Warning);
        assert_eq!(classify("Build complete"), LogType::Success);
        assert_eq!(classify("Starting dev server"), LogType::Info);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let first = process_line("\x1b[33mWARN\x1b[0m  Require cycle: a.js -> b.js").unwrap();
        let second = process_line("\x1b[33mWARN\x1b[0m  Require cycle: a.js -> b.js").unwrap();
        assert_eq!(first.message, second.message);
        assert_eq!(first.log_type, second.log_type);
        assert_eq!(first.message, "WARN  Require cycle: a.js -> b.js");
    }

    #[test]
    fn test_detect_ready_signals() {
        assert_eq!(
            detect_signal("Metro waiting on http://localhost:8081"),
            Some(OutputSignal::Ready)
        );
        assert_eq!(
            detect_signal("\x1b[1mBundler is ready\x1b[0m"),
            Some(OutputSignal::Ready)
        );
        assert_eq!(
            detect_signal("Development server listening"),
            Some(OutputSignal::Ready)
        );
        assert_eq!(detect_signal("Installing packages"), None);
    }

    #[test]
    fn test_detect_conflict_signals() {
        assert_eq!(
            detect_signal("Error: listen EADDRINUSE: address already in use :::8081"),
            Some(OutputSignal::Conflict)
        );
        assert_eq!(
            detect_signal("Port 8081 is being used by another process"),
            Some(OutputSignal::Conflict)
        );
        // Readiness suppresses the broad port+use heuristic
        assert_eq!(
            detect_signal("Metro is ready, use port 8081"),
            Some(OutputSignal::Ready)
        );
    }

    #[test]
    fn test_line_assembler_reassembles_partial_lines() {
        let mut assembler = LineAssembler::default();
        assert!(assembler.push("Metro wait").is_empty());
        assert_eq!(
            assembler.push("ing on http://localhost:8081\r\nnext "),
            vec!["Metro waiting on http://localhost:8081".to_string()]
        );
        assert_eq!(assembler.push("line\n\n"), vec!["next line".to_string()]);
        assert_eq!(assembler.flush(), None);
        assembler.push("tail");
        assert_eq!(assembler.flush(), Some("tail".to_string()));
    }

    #[test]
    fn test_pipeline_keeps_streams_apart() {
        let mut pipeline = LogPipeline::new();
        let out = pipeline.ingest(StreamKind::Stdout, "stdout partial ");
        assert!(out.entries.is_empty());
        let err = pipeline.ingest(StreamKind::Stderr, "stderr error line\n");
        assert_eq!(err.entries.len(), 1);
        assert_eq!(err.entries[0].message, "stderr error line");
        let out = pipeline.ingest(StreamKind::Stdout, "continues here\n");
        assert_eq!(out.entries[0].message, "stdout partial continues here");
    }

    #[test]
    fn test_pipeline_signal_ignores_filter() {
        let mut pipeline = LogPipeline::new();
        // Too short to be logged, but still a conflict marker
        let out = pipeline.ingest(StreamKind::Stderr, "EADDRINUSE\n");
        assert_eq!(out.signal, Some(OutputSignal::Conflict));
    }

    #[test]
    fn test_pipeline_sees_ready_split_across_reads() {
        let mut pipeline = LogPipeline::new();
        let first = pipeline.ingest(StreamKind::Stdout, "Metro wait");
        assert_eq!(first.signal, None);

        let second = pipeline.ingest(StreamKind::Stdout, "ing on http://localhost:8081\n");
        assert_eq!(second.signal, Some(OutputSignal::Ready));
    }

    #[test]
    fn test_pipeline_finish_flushes_partials() {
        let mut pipeline = LogPipeline::new();
        pipeline.ingest(StreamKind::Stdout, "Build failed without newline");
        let trailing = pipeline.finish();
        assert_eq!(trailing.len(), 1);
        assert_eq!(trailing[0].log_type, LogType::Error);
    }

    fn info_entries(count: usize) -> Vec<LogEntry> {
        (0..count)
            .map(|i| LogEntry::info(format!("line number {}", i)))
            .collect()
    }

    #[test]
    fn test_retention_single_large_ingest() {
        let mut store = LogStore::default();
        store.append(info_entries(1250));

        assert_eq!(store.len(), 1001);
        assert_eq!(store.iter().next().unwrap().message, "line number 250");
        let note = store.last().unwrap();
        assert_eq!(note.log_type, LogType::Info);
        assert!(note.message.contains("removed 250"));
    }

    #[test]
    fn test_retention_sequential_ingest_settles_at_cap() {
        let mut store = LogStore::default();
        for entry in info_entries(1250) {
            store.append([entry]);
            assert!(store.len() <= 1001);
        }

        assert_eq!(store.len(), 1001);
        assert_eq!(store.iter().next().unwrap().message, "line number 250");
        assert_eq!(store.iter().nth(999).unwrap().message, "line number 1249");

        let notes: Vec<_> = store
            .iter()
            .filter(|entry| entry.message.starts_with("Log cleanup"))
            .collect();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message, "Log cleanup: removed 250 older entries");
        assert_eq!(store.last().unwrap().message, notes[0].message);
    }

    #[test]
    fn test_engine_notes_bounded_by_threshold() {
        let mut store = LogStore::default();
        for i in 0..1200 {
            store.push(LogEntry::info(format!("note {}", i)));
        }
        assert_eq!(store.len(), 1200);

        store.push(LogEntry::info("one too many"));
        assert_eq!(store.len(), 1001);
        assert!(store.last().unwrap().message.contains("removed 201"));
    }

    #[test]
    fn test_trim_to_cap_only_above_cap() {
        let mut store = LogStore::default();
        for entry in info_entries(900) {
            store.push(entry);
        }
        assert_eq!(store.trim_to_cap(), None);
        for entry in info_entries(150) {
            store.push(entry);
        }
        assert_eq!(store.trim_to_cap(), Some(50));
        assert_eq!(store.len(), 1001);
        assert_eq!(store.trim_to_cap(), None);
    }

    #[test]
    fn test_append_reports_stored_count() {
        let mut store = LogStore::default();
        assert_eq!(store.append(info_entries(3)), 3);
        assert_eq!(store.append(Vec::new()), 0);

        // Crossing the cap stores the cleanup note as well
        assert_eq!(store.append(info_entries(998)), 999);
        assert_eq!(store.len(), 1001);
    }

    #[test]
    fn test_after_returns_entries_past_cursor() {
        let mut store = LogStore::default();
        store.append(info_entries(3));
        let cursor = store.iter().nth(1).unwrap().seq;

        let newer = store.after(cursor);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].message, "line number 2");

        // Sequence survives a clear, so an old cursor still sees new entries
        store.clear();
        store.push(LogEntry::info("after clear"));
        let newer = store.after(cursor);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].message, "after clear");
        assert_eq!(newer[0].seq + 1, store.sequence());
    }

    #[test]
    fn test_force_cleanup_keeps_errors_only() {
        let mut store = LogStore::default();
        store.push(LogEntry::info("starting"));
        store.push(LogEntry::error("boom"));
        store.push(LogEntry::new("careful", LogType::Warning));
        store.push(LogEntry::error("boom again"));

        assert_eq!(store.force_cleanup(), 2);
        let messages: Vec<_> = store.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["boom", "boom again"]);

        let mut empty = LogStore::default();
        empty.push(LogEntry::info("only info"));
        empty.force_cleanup();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_compress_collapses_consecutive_runs() {
        let mut store = LogStore::default();
        store.push(LogEntry::new("same warning", LogType::Warning));
        store.push(LogEntry::new("same warning", LogType::Warning));
        store.push(LogEntry::new("same warning", LogType::Error));
        store.push(LogEntry::info("different"));
        store.push(LogEntry::new("same warning", LogType::Warning));

        let removed = store.compress();
        assert_eq!(removed, 2);

        let entries: Vec<_> = store
            .iter()
            .map(|e| (e.message.clone(), e.log_type))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("same warning (x3)".to_string(), LogType::Warning),
                ("different".to_string(), LogType::Info),
                ("same warning".to_string(), LogType::Warning),
            ]
        );
    }

    #[test]
    fn test_compress_never_grows() {
        let mut store = LogStore::default();
        store.append(info_entries(10));
        assert_eq!(store.compress(), 0);
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn test_query_since_and_limit() {
        let mut store = LogStore::default();
        store.append(info_entries(5));
        let newest = store.query(None, Some(2));
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[1].message, "line number 4");

        let future = Utc::now() + chrono::Duration::minutes(1);
        assert!(store.query(Some(future), None).is_empty());
    }
}
