// ABOUTME: Child process spawning with piped output and idempotent termination
// ABOUTME: Output arrives as chunk events on a channel; exit is reported exactly once

use crate::types::{SupervisorError, SupervisorResult};
use metrodeck_config as names;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Extra locations searched for node and friends, after the inherited PATH
const EXTRA_BIN_DIRS: &[&str] = &["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin", "/bin"];

/// Dotenv files merged into the child environment, later files win
const DOTENV_FILES: &[&str] = &[".env", ".env.local", ".env.development"];

const READ_BUFFER_SIZE: usize = 8192;

/// How long the waiter gives the readers to flush after exit
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// Event delivered from a running child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { stream: StreamKind, chunk: String },
    /// Sent once, after both output streams have been drained
    Exited(ExitInfo),
}

/// Fully resolved command line for a child process
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Command line as it would be typed into a shell
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug)]
enum Control {
    Kill,
}

/// Cloneable handle to a spawned child.
///
/// Signalling an exited child is a no-op, so `terminate` and `kill` may be
/// called any number of times.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    exited: watch::Receiver<bool>,
    control: mpsc::UnboundedSender<Control>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Ask the process group to shut down gracefully
    pub fn terminate(&self) -> SupervisorResult<()> {
        if self.has_exited() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGTERM)
        }

        #[cfg(not(unix))]
        {
            // No graceful signal available; fall back to a hard kill
            self.kill()
        }
    }

    /// Forcefully stop the process group
    pub fn kill(&self) -> SupervisorResult<()> {
        if self.has_exited() {
            return Ok(());
        }

        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL)?;

        // The waiter may already be gone, which means the child is too
        let _ = self.control.send(Control::Kill);
        Ok(())
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> SupervisorResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.pid as i32);
        let result = match killpg(pid, signal) {
            // Group already gone or never formed; try the leader alone
            Err(Errno::ESRCH) | Err(Errno::EPERM) => kill(pid, signal),
            other => other,
        };

        match result {
            Ok(()) => {
                debug!("Sent {} to process group {}", signal, self.pid);
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SupervisorError::TerminationFailure {
                pid: self.pid,
                reason: format!("Failed to send {}: {}", signal, e),
            }),
        }
    }

    /// Wait until the child has exited. Returns false on timeout.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        let wait = async {
            while !*exited.borrow_and_update() {
                if exited.changed().await.is_err() {
                    // Waiter dropped, the child is gone
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// A freshly spawned child: its control handle plus the event stream
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Spawn `command` with piped output.
///
/// The child is placed in its own process group so bundler workers go down
/// with it. Output is delivered as it arrives.
pub fn spawn(command: &LaunchCommand) -> SupervisorResult<SpawnedProcess> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(&command.working_dir)
        .env_clear()
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailure {
        command: command.display(),
        reason: e.to_string(),
    })?;

    let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailure {
        command: command.display(),
        reason: "process exited before its pid could be read".to_string(),
    })?;

    info!("Spawned '{}' with PID: {}", command.display(), pid);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (exited_tx, exited_rx) = watch::channel(false);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, StreamKind::Stdout, event_tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, StreamKind::Stderr, event_tx.clone())));
    }

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Some(Control::Kill) = control_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    debug!("start_kill for PID {} failed: {}", pid, e);
                }
                child.wait().await
            }
        };

        let exit = match status {
            Ok(status) => ExitInfo::from_status(status),
            Err(e) => {
                warn!("Failed to wait on PID {}: {}", pid, e);
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        debug!("PID {} exited with {}", pid, exit.describe());
        let _ = exited_tx.send(true);

        let drain = async {
            for reader in readers {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, drain).await.is_err() {
            // A grandchild may still hold the pipes open
            debug!("Output of PID {} still open after exit", pid);
        }

        let _ = event_tx.send(ProcessEvent::Exited(exit));
    });

    Ok(SpawnedProcess {
        handle: ProcessHandle {
            pid,
            exited: exited_rx,
            control: control_tx,
        },
        events: event_rx,
    })
}

async fn pump<R>(mut reader: R, stream: StreamKind, tx: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let chunk = take_utf8(&mut pending);
                if !chunk.is_empty() && tx.send(ProcessEvent::Output { stream, chunk }).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Read from {:?} failed: {}", stream, e);
                break;
            }
        }
    }

    if !pending.is_empty() {
        let chunk = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(ProcessEvent::Output { stream, chunk });
    }
}

/// Decode as much of `pending` as possible, keeping an incomplete trailing
/// UTF-8 sequence for the next read
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// Environment for a dev server child of the project at `project_path`
pub fn build_child_env(project_path: &Path) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    env.remove(names::CI);
    env.entry(names::NODE_ENV.to_string())
        .or_insert_with(|| "development".to_string());

    let mut search: Vec<PathBuf> = vec![project_path.join("node_modules").join(".bin")];
    if let Some(existing) = env.get(names::PATH) {
        search.extend(std::env::split_paths(existing));
    }
    search.extend(EXTRA_BIN_DIRS.iter().map(PathBuf::from));

    let mut deduped: Vec<PathBuf> = Vec::with_capacity(search.len());
    for dir in search {
        if !dir.as_os_str().is_empty() && !deduped.contains(&dir) {
            deduped.push(dir);
        }
    }
    match std::env::join_paths(&deduped) {
        Ok(joined) => {
            env.insert(names::PATH.to_string(), os_to_string(joined));
        }
        Err(e) => warn!("Could not build PATH for {}: {}", project_path.display(), e),
    }

    for file in DOTENV_FILES {
        merge_dotenv(&mut env, &project_path.join(file));
    }

    env
}

fn os_to_string(value: OsString) -> String {
    value.to_string_lossy().into_owned()
}

fn merge_dotenv(env: &mut HashMap<String, String>, path: &Path) {
    if !path.is_file() {
        return;
    }

    match dotenvy::from_path_iter(path) {
        Ok(items) => {
            let mut merged = 0;
            for item in items {
                match item {
                    Ok((key, value)) => {
                        env.insert(key, value);
                        merged += 1;
                    }
                    Err(e) => debug!("Skipping line in {}: {}", path.display(), e),
                }
            }
            debug!("Merged {} variables from {}", merged, path.display());
        }
        Err(e) => warn!("Failed to read {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_take_utf8_keeps_incomplete_tail() {
        // "é" is 0xC3 0xA9
        let mut pending = vec![b'c', b'a', b'f', 0xC3];
        assert_eq!(take_utf8(&mut pending), "caf");
        assert_eq!(pending, vec![0xC3]);
        pending.push(0xA9);
        assert_eq!(take_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_exit_info_describe() {
        let exit = ExitInfo {
            code: Some(1),
            signal: None,
        };
        assert_eq!(exit.describe(), "exit code 1");
        assert!(!exit.success());

        let exit = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(exit.describe(), "signal 9");
    }

    #[test]
    fn test_launch_command_display() {
        let cmd = LaunchCommand::new("/p/node_modules/.bin/expo", "/p")
            .arg("start")
            .args(["--port", "8081"]);
        assert_eq!(cmd.display(), "/p/node_modules/.bin/expo start --port 8081");
    }

    #[test]
    #[serial]
    fn test_build_child_env_path_and_ci() {
        let dir = TempDir::new().unwrap();
        std::env::set_var(names::CI, "true");
        let env = build_child_env(dir.path());
        std::env::remove_var(names::CI);

        assert!(!env.contains_key(names::CI));
        let path = env.get(names::PATH).unwrap();
        let entries: Vec<PathBuf> = std::env::split_paths(path).collect();
        assert_eq!(entries[0], dir.path().join("node_modules").join(".bin"));
        assert!(entries.contains(&PathBuf::from("/usr/local/bin")));
        let bins = entries
            .iter()
            .filter(|p| p.as_path() == Path::new("/usr/bin"))
            .count();
        assert_eq!(bins, 1);
    }

    #[test]
    #[serial]
    fn test_build_child_env_node_env_and_dotenv() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "API_URL=http://a\nSHARED=base\n").unwrap();
        std::fs::write(dir.path().join(".env.local"), "SHARED=local\n").unwrap();
        std::env::remove_var(names::NODE_ENV);

        let env = build_child_env(dir.path());
        assert_eq!(env.get(names::NODE_ENV).map(String::as_str), Some("development"));
        assert_eq!(env.get("API_URL").map(String::as_str), Some("http://a"));
        assert_eq!(env.get("SHARED").map(String::as_str), Some("local"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let cmd = LaunchCommand::new(dir.path().join("node_modules/.bin/expo"), dir.path());
        match spawn(&cmd) {
            Err(SupervisorError::SpawnFailure { command, .. }) => {
                assert!(command.contains("node_modules/.bin/expo"));
            }
            other => panic!("expected SpawnFailure, got {:?}", other.map(|p| p.handle)),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_streams_output_then_exit() {
        let dir = TempDir::new().unwrap();
        let cmd = LaunchCommand::new("/bin/sh", dir.path())
            .args(["-c", "echo hello; echo oops 1>&2; exit 3"])
            .env(build_child_env(dir.path()));
        let SpawnedProcess { handle, mut events } = spawn(&cmd).unwrap();

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit = None;
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output { stream: StreamKind::Stdout, chunk } => stdout.push_str(&chunk),
                ProcessEvent::Output { stream: StreamKind::Stderr, chunk } => stderr.push_str(&chunk),
                ProcessEvent::Exited(info) => {
                    exit = Some(info);
                    break;
                }
            }
        }

        assert_eq!(stdout, "hello\n");
        assert_eq!(stderr, "oops\n");
        assert_eq!(exit.unwrap().code, Some(3));
        assert!(handle.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cmd = LaunchCommand::new("/bin/sh", dir.path())
            .args(["-c", "sleep 30"])
            .env(build_child_env(dir.path()));
        let spawned = spawn(&cmd).unwrap();
        let handle = spawned.handle;

        handle.terminate().unwrap();
        assert!(handle.wait_exited(Duration::from_secs(5)).await);
        handle.terminate().unwrap();
        handle.kill().unwrap();
    }
}
