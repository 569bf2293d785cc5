use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Lifecycle state of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl LifecycleState {
    /// True while the instance's controller may still own an OS process
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopping => write!(f, "stopping"),
            LifecycleState::Crashed => write!(f, "crashed"),
        }
    }
}

/// Supervisor-wide unique identifier for an instance slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of one instance as reported by `status()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: InstanceId,
    pub app: String,
    /// Index within the application, `0..instances`
    pub instance: usize,
    pub pid: Option<u32>,
    pub state: LifecycleState,
    pub started_at: Option<SystemTime>,
    /// Total restarts since the last manual restart
    pub restarts: u32,
    /// Last sampled resident memory in bytes
    pub memory: u64,
    pub last_error: Option<String>,
}

impl ProcessHandle {
    pub fn new(id: InstanceId, app: &str, instance: usize) -> Self {
        Self {
            id,
            app: app.to_string(),
            instance,
            pid: None,
            state: LifecycleState::Stopped,
            started_at: None,
            restarts: 0,
            memory: 0,
            last_error: None,
        }
    }

    /// Time since the current process started, zero when not running
    pub fn uptime(&self) -> Duration {
        match (self.state, self.started_at) {
            (LifecycleState::Running, Some(started)) => SystemTime::now()
                .duration_since(started)
                .unwrap_or(Duration::from_secs(0)),
            _ => Duration::from_secs(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_is_stopped() {
        let handle = ProcessHandle::new(InstanceId(7), "bot", 1);
        assert_eq!(handle.state, LifecycleState::Stopped);
        assert_eq!(handle.pid, None);
        assert_eq!(handle.restarts, 0);
        assert_eq!(handle.uptime(), Duration::from_secs(0));
    }

    #[test]
    fn test_uptime_only_while_running() {
        let mut handle = ProcessHandle::new(InstanceId(1), "bot", 0);
        handle.started_at = Some(SystemTime::now() - Duration::from_secs(5));
        assert_eq!(handle.uptime(), Duration::from_secs(0));

        handle.state = LifecycleState::Running;
        assert!(handle.uptime() >= Duration::from_secs(5));
    }

    #[test]
    fn test_state_display_and_activity() {
        assert_eq!(LifecycleState::Crashed.to_string(), "crashed");
        assert!(LifecycleState::Stopping.is_active());
        assert!(!LifecycleState::Crashed.is_active());
        assert!(!LifecycleState::Stopped.is_active());
    }
}
