// IPC Protocol definitions for client-daemon communication

use crate::logs::LogSelection;
use crate::process::ProcessHandle;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Options for `start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Absolute path of a descriptor file, or the name of a registered application
    pub target: String,
    /// Only start this entry of the descriptor
    pub only: Option<String>,
}

/// Options for `logs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogOptions {
    pub name: String,
    pub lines: usize,
    pub selection: LogSelection,
}

/// Daemon management commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonCommand {
    Status,
    Stop,
}

/// All available commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Start(StartOptions),
    Stop { name: String },
    Restart { name: String },
    Reload { name: String },
    Status { name: Option<String> },
    Logs(LogOptions),
    Delete { name: String },
    Daemon(DaemonCommand),
}

/// An application that could not be started, with the reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartFailure {
    pub name: String,
    pub error: String,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    Started {
        handles: Vec<ProcessHandle>,
        /// Entries whose instances were already live
        skipped: Vec<String>,
        /// Entries rejected by the loader or failing to start
        failed: Vec<StartFailure>,
    },
    Stopped(Vec<ProcessHandle>),
    Restarted(Vec<ProcessHandle>),
    Reloaded(Vec<ProcessHandle>),
    Status(Vec<ProcessHandle>),
    Logs { path: PathBuf, lines: Vec<String> },
    Deleted { name: String },
    DaemonStatus {
        pid: u32,
        uptime: Duration,
        apps: usize,
    },
    /// Generic success message
    Success(String),
}

/// Request message from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{InstanceId, LifecycleState};

    #[test]
    fn test_request_wire_format_is_one_line() {
        let request = Request::new(
            7,
            Command::Logs(LogOptions {
                name: "bot".into(),
                lines: 20,
                selection: LogSelection::Err,
            }),
        );
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains('\n'));

        let decoded: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_error_response_carries_message() {
        let response = Response::error(3, "No such application: ghost".into());
        let json = serde_json::to_string(&response).unwrap();
        let decoded: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, 3);
        assert_eq!(decoded.result, Err("No such application: ghost".to_string()));
    }

    #[test]
    fn test_status_response_with_handles() {
        let mut handle = ProcessHandle::new(InstanceId(1), "bot", 0);
        handle.state = LifecycleState::Running;
        handle.pid = Some(4242);
        handle.last_error = Some("process exit status: 1".into());

        let response = Response::success(1, ResponseData::Status(vec![handle.clone()]));
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"running\""));

        let decoded: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.result, Ok(ResponseData::Status(vec![handle])));
    }
}
