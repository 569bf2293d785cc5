use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Shepherd supervisor
#[derive(Debug, Error)]
pub enum ShepherdError {
    // Descriptor errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Application '{app}' is missing required field '{field}'")]
    MissingConfigField { app: String, field: String },

    #[error("Invalid memory limit '{0}': expected a byte count or a number with a K, M or G suffix")]
    InvalidMemoryLimit(String),

    #[error("Application '{app}': path does not exist: {}", path.display())]
    PathNotFound { app: String, path: PathBuf },

    // Lifecycle errors
    #[error("Failed to launch '{app}': {reason}")]
    Launch { app: String, reason: String },

    #[error("Failed to open log sink {}: {reason}", path.display())]
    LogSink { path: PathBuf, reason: String },

    #[error("Instance {instance} of '{app}' exceeded its memory limit: {rss} bytes used, limit {limit} bytes")]
    MemoryLimitExceeded {
        app: String,
        instance: usize,
        rss: u64,
        limit: u64,
    },

    #[error("Restart limit exceeded for '{0}'")]
    RestartLimitExceeded(String),

    #[error("No such application: {0}")]
    AppNotFound(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("File watch error: {0}")]
    Watch(String),

    // IPC errors
    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Failed to connect to daemon: {0}")]
    Connection(String),

    #[error("IPC protocol error: {0}")]
    Protocol(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Daemon already running")]
    DaemonAlreadyRunning,

    // Persistence errors
    #[error("State store error: {0}")]
    State(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ShepherdError {
    /// True for errors raised while loading or validating a descriptor
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ShepherdError::Config(_)
                | ShepherdError::MissingConfigField { .. }
                | ShepherdError::InvalidMemoryLimit(_)
        )
    }

    /// Process exit code for the CLI: 2 for descriptor problems, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_config_error() {
            2
        } else {
            1
        }
    }
}

/// Result type alias for Shepherd operations
pub type Result<T> = std::result::Result<T, ShepherdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_classification() {
        assert!(ShepherdError::Config("bad".into()).is_config_error());
        assert!(ShepherdError::InvalidMemoryLimit("1X".into()).is_config_error());
        assert!(ShepherdError::MissingConfigField {
            app: "x".into(),
            field: "script".into()
        }
        .is_config_error());
        assert!(!ShepherdError::AppNotFound("x".into()).is_config_error());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShepherdError::Config("bad".into()).exit_code(), 2);
        assert_eq!(ShepherdError::DaemonNotRunning.exit_code(), 1);
        assert_eq!(ShepherdError::AppNotFound("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_memory_limit_message() {
        let err = ShepherdError::MemoryLimitExceeded {
            app: "bot".into(),
            instance: 0,
            rss: 2048,
            limit: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("bot"));
        assert!(msg.contains("2048"));
        assert!(msg.contains("1024"));
    }
}
