// Daemon lifecycle management from the outside: status, launch, stop

use super::pid::{is_process_alive, PidFile};
use crate::config::DaemonSettings;
use crate::error::{Result, ShepherdError};
use crate::ipc::IpcClient;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Name of the daemon binary, looked up next to the CLI first
const DAEMON_BINARY: &str = "shepherd-daemon";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct DaemonManager {
    settings: DaemonSettings,
    pid_file: PidFile,
}

/// Daemon status information
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
    pub socket_path: PathBuf,
}

impl DaemonManager {
    pub fn new(settings: DaemonSettings) -> Self {
        let pid_file = PidFile::with_path(&settings.pid_file);
        Self { settings, pid_file }
    }

    pub fn is_running(&self) -> bool {
        self.pid_file.live_pid().is_some()
    }

    pub fn status(&self) -> DaemonStatus {
        let pid = self.pid_file.live_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.path().to_path_buf(),
            socket_path: self.settings.socket_path.clone(),
        }
    }

    /// Claim the PID file for the current process (called by the daemon)
    pub fn register(&self) -> Result<()> {
        if let Some(pid) = self.pid_file.live_pid() {
            if pid != std::process::id() {
                return Err(ShepherdError::DaemonAlreadyRunning);
            }
        }
        self.pid_file.remove()?;
        self.pid_file.write()
    }

    pub fn unregister(&self) -> Result<()> {
        self.pid_file.remove()
    }

    /// Spawn the daemon binary detached; use `wait_ready` to wait for its socket
    pub fn launch(&self) -> Result<()> {
        if self.is_running() {
            return Err(ShepherdError::DaemonAlreadyRunning);
        }

        let binary = Self::daemon_binary();
        tracing::debug!(binary = %binary.display(), "Launching daemon");

        let mut child = std::process::Command::new(&binary)
            .arg("--daemonize")
            .env("SHEPHERD_HOME", &self.settings.home)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| {
                ShepherdError::Other(format!(
                    "Failed to launch {}: {}",
                    binary.display(),
                    e
                ))
            })?;

        // The first fork exits right away; reap it
        let status = child.wait()?;
        if !status.success() {
            return Err(ShepherdError::Other(format!(
                "Daemon exited during startup ({}), see {}",
                status,
                self.settings.daemon_log.display()
            )));
        }
        Ok(())
    }

    /// Block until the daemon answers on its socket
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let client = IpcClient::with_socket_path(&self.settings.socket_path);
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if client.is_daemon_running() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        Err(ShepherdError::Connection(format!(
            "Daemon did not open {} within {:?}, see {}",
            self.settings.socket_path.display(),
            timeout,
            self.settings.daemon_log.display()
        )))
    }

    /// SIGTERM the daemon, then SIGKILL if it outlives `timeout`. Returns
    /// the PID that was stopped.
    #[cfg(unix)]
    pub fn stop(&self, timeout: Duration) -> Result<u32> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = self.pid_file.live_pid().ok_or(ShepherdError::DaemonNotRunning)?;
        let target = Pid::from_raw(pid as i32);

        kill(target, Signal::SIGTERM)
            .map_err(|e| ShepherdError::Signal(format!("Failed to send SIGTERM: {}", e)))?;

        if Self::wait_exit(pid, timeout) {
            self.pid_file.remove()?;
            return Ok(pid);
        }

        tracing::warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
        kill(target, Signal::SIGKILL)
            .map_err(|e| ShepherdError::Signal(format!("Failed to send SIGKILL: {}", e)))?;

        if Self::wait_exit(pid, Duration::from_secs(1)) {
            self.pid_file.remove()?;
            return Ok(pid);
        }

        Err(ShepherdError::Signal(format!(
            "Daemon (PID {}) survived SIGKILL",
            pid
        )))
    }

    #[cfg(not(unix))]
    pub fn stop(&self, _timeout: Duration) -> Result<u32> {
        Err(ShepherdError::Other(
            "Daemon stop is only supported on Unix systems".to_string(),
        ))
    }

    fn wait_exit(pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !is_process_alive(pid) {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        !is_process_alive(pid)
    }

    fn daemon_binary() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BINARY)))
            .filter(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(DAEMON_BINARY))
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(temp_dir: &TempDir) -> DaemonManager {
        DaemonManager::new(DaemonSettings::with_home(temp_dir.path()))
    }

    #[test]
    fn test_not_running_without_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let status = manager.status();
        assert!(!status.running);
        assert!(status.pid.is_none());
        assert_eq!(status.socket_path, temp_dir.path().join("shepherd.sock"));
    }

    #[test]
    fn test_register_and_unregister() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        manager.register().unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.status().pid, Some(std::process::id()));

        manager.unregister().unwrap();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        // PIDs this large are never handed out
        std::fs::write(temp_dir.path().join("shepherd.pid"), "999999999").unwrap();

        assert!(!manager.is_running());
        manager.register().unwrap();
        assert_eq!(manager.status().pid, Some(std::process::id()));
    }

    #[test]
    fn test_stop_when_not_running() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        assert!(matches!(
            manager.stop(Duration::from_secs(1)),
            Err(ShepherdError::DaemonNotRunning)
        ));
    }

    #[test]
    fn test_wait_ready_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        assert!(matches!(
            manager.wait_ready(Duration::from_millis(200)),
            Err(ShepherdError::Connection(_))
        ));
    }
}
