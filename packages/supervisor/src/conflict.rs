// ABOUTME: Port conflict resolution by locating and terminating listeners
// ABOUTME: Escalates from SIGTERM to SIGKILL and verifies the process is gone

use crate::port::{find_pids_on_port, is_port_available};
use crate::types::{SupervisorError, SupervisorResult};
use std::time::Duration;
use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessStatus, System};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a port may linger after its owner died
const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether `pid` is a live process. Zombies count as dead.
pub fn is_process_alive(pid: u32) -> bool {
    let sys_pid = SysPid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new()) {
        return false;
    }

    match system.process(sys_pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Frees busy ports by terminating whoever is listening on them
#[derive(Debug, Clone)]
pub struct PortConflictResolver {
    grace: Duration,
}

impl PortConflictResolver {
    /// `grace` is the wait between the graceful and the forced signal
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// PIDs listening on `port`, never including this process
    pub async fn owners(&self, port: u16) -> Vec<u32> {
        let own = std::process::id();
        find_pids_on_port(port)
            .await
            .into_iter()
            .filter(|&pid| pid != own)
            .collect()
    }

    /// Terminate one process, escalating to a forced kill after the grace period
    pub async fn terminate_pid(&self, pid: u32) -> SupervisorResult<()> {
        if pid == std::process::id() {
            return Err(SupervisorError::TerminationFailure {
                pid,
                reason: "refusing to terminate the supervisor itself".to_string(),
            });
        }

        if !is_process_alive(pid) {
            debug!("Process {} already gone", pid);
            return Ok(());
        }

        send_graceful(pid)?;
        info!("Sent graceful termination to PID {}", pid);
        if self.wait_for_exit(pid, self.grace).await {
            info!("Process {} terminated gracefully", pid);
            return Ok(());
        }

        warn!("Process {} did not respond to SIGTERM, sending SIGKILL", pid);
        send_forced(pid)?;
        if self.wait_for_exit(pid, self.grace).await {
            info!("Process {} terminated after SIGKILL", pid);
            return Ok(());
        }

        Err(SupervisorError::TerminationFailure {
            pid,
            reason: "process did not terminate even after SIGKILL".to_string(),
        })
    }

    /// Terminate every PID, collecting the ones that survived
    pub async fn terminate_all(&self, pids: &[u32]) -> Vec<u32> {
        let mut survivors = Vec::new();
        for &pid in pids {
            if let Err(e) = self.terminate_pid(pid).await {
                warn!("{}", e);
                survivors.push(pid);
            }
        }
        survivors
    }

    /// Poll until `pid` is gone. Returns false on timeout.
    pub async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !is_process_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until `port` probes as free. Returns false on timeout.
    pub async fn wait_until_free(&self, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if is_port_available(port) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Terminate every listener on `port` and confirm the port is free again
    pub async fn free_port(&self, port: u16) -> SupervisorResult<()> {
        if is_port_available(port) {
            return Ok(());
        }

        let pids = self.owners(port).await;
        if pids.is_empty() {
            debug!("Port {} is busy but no owning process is visible", port);
        } else {
            info!("Freeing port {} held by PIDs {:?}", port, pids);
            self.terminate_all(&pids).await;
        }

        if self.wait_until_free(port, PORT_RELEASE_TIMEOUT).await {
            Ok(())
        } else {
            Err(SupervisorError::PortConflict {
                port,
                pids: self.owners(port).await,
            })
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> SupervisorResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), signal) {
        // Already exited between the liveness check and the signal
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::TerminationFailure {
            pid,
            reason: format!("Failed to send {}: {}", signal, e),
        }),
    }
}

#[cfg(unix)]
fn send_graceful(pid: u32) -> SupervisorResult<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn send_forced(pid: u32) -> SupervisorResult<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
fn send_graceful(pid: u32) -> SupervisorResult<()> {
    send_forced(pid)
}

#[cfg(not(unix))]
fn send_forced(pid: u32) -> SupervisorResult<()> {
    let sys_pid = SysPid::from_u32(pid);
    let mut system = System::new();
    system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    match system.process(sys_pid) {
        Some(process) if !process.kill() => Err(SupervisorError::TerminationFailure {
            pid,
            reason: "kill request was rejected".to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_unknown_pid_is_dead() {
        // Above the default pid_max on every supported platform
        assert!(!is_process_alive(99_999_999));
    }

    #[tokio::test]
    async fn test_refuses_to_terminate_self() {
        let resolver = PortConflictResolver::new(Duration::from_millis(200));
        let err = resolver.terminate_pid(std::process::id()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::TerminationFailure { .. }));
    }

    #[tokio::test]
    async fn test_free_port_on_free_port_is_noop() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let resolver = PortConflictResolver::new(Duration::from_millis(200));
        assert!(resolver.free_port(port).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_pid_escalates_past_ignored_sigterm() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "trap '' TERM; while true; do sleep 0.1; done"])
            .spawn()
            .unwrap();
        let pid = child.id();
        // Give the shell time to install the trap
        sleep(Duration::from_millis(200)).await;

        let resolver = PortConflictResolver::new(Duration::from_millis(300));
        let reaper = std::thread::spawn(move || child.wait());
        resolver.terminate_pid(pid).await.unwrap();
        assert!(reaper.join().unwrap().is_ok());
    }
}
