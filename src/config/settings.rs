use crate::logs::DEFAULT_MAX_LOG_SIZE;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default home directory for daemon files
const DEFAULT_HOME: &str = "/tmp/shepherd";

/// Default interval between memory samples
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Default number of log lines queued per application before lines are dropped
const DEFAULT_LOG_QUEUE: usize = 1024;

/// Locations of the files the daemon owns
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub home: PathBuf,
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub state_file: PathBuf,
    pub daemon_log: PathBuf,
    pub log_dir: PathBuf,
}

impl DaemonSettings {
    /// Build settings rooted at `SHEPHERD_HOME`, falling back to `/tmp/shepherd`
    pub fn from_env() -> Self {
        let home = std::env::var_os("SHEPHERD_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME));
        Self::with_home(home)
    }

    /// Build settings rooted at an explicit directory
    pub fn with_home<P: AsRef<Path>>(home: P) -> Self {
        let home = home.as_ref().to_path_buf();
        Self {
            socket_path: home.join("shepherd.sock"),
            pid_file: home.join("shepherd.pid"),
            state_file: home.join("state.json"),
            daemon_log: home.join("daemon.log"),
            log_dir: home.join("logs"),
            home,
        }
    }

    /// Create the home and log directories
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)?;
        std::fs::create_dir_all(&self.log_dir)
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Runtime knobs for the supervisor itself (not per application)
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often the resource monitor samples memory
    pub poll_interval: Duration,
    /// Size at which a log sink is rotated
    pub max_log_size: u64,
    /// Lines buffered between pipe readers and the sink writer
    pub log_queue: usize,
    /// How long to wait for a sink writer to drain on close
    pub log_close_timeout: Duration,
}

impl SupervisorConfig {
    /// Defaults, with the poll interval overridable via `SHEPHERD_POLL_INTERVAL_MS`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = std::env::var("SHEPHERD_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            config.poll_interval = Duration::from_millis(ms);
        }
        config
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            log_queue: DEFAULT_LOG_QUEUE,
            log_close_timeout: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_under_home() {
        let settings = DaemonSettings::with_home("/var/lib/shepherd");
        assert_eq!(settings.socket_path, PathBuf::from("/var/lib/shepherd/shepherd.sock"));
        assert_eq!(settings.pid_file, PathBuf::from("/var/lib/shepherd/shepherd.pid"));
        assert_eq!(settings.state_file, PathBuf::from("/var/lib/shepherd/state.json"));
        assert_eq!(settings.log_dir, PathBuf::from("/var/lib/shepherd/logs"));
    }

    #[test]
    fn test_supervisor_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_log_size, 10 * 1024 * 1024);
        assert_eq!(config.log_queue, 1024);
    }

    #[test]
    fn test_ensure_dirs() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let settings = DaemonSettings::with_home(temp_dir.path().join("home"));
        settings.ensure_dirs().unwrap();
        assert!(settings.home.is_dir());
        assert!(settings.log_dir.is_dir());
    }
}
