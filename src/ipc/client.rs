// IPC Client - Communicates with the daemon via Unix socket

use crate::error::{Result, ShepherdError};
use crate::ipc::{Command, Request, Response, ResponseData};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Maximum number of connection attempts
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// IPC client for communicating with the daemon
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Send a command and return the daemon's response
    pub fn send_command(&self, command: Command) -> Result<Response> {
        let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(request_id, command);

        let mut last_error = None;
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            match self.try_send_request(&request) {
                Ok(response) => {
                    if response.id != request_id {
                        return Err(ShepherdError::Protocol(format!(
                            "Response ID mismatch: expected {}, got {}",
                            request_id, response.id
                        )));
                    }
                    return Ok(response);
                }
                // Nothing is listening; retrying will not help
                Err(ShepherdError::DaemonNotRunning) => return Err(ShepherdError::DaemonNotRunning),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRY_ATTEMPTS {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ShepherdError::Connection("Failed to connect after retries".to_string())
        }))
    }

    /// Send a command and unwrap the daemon's answer; daemon-side errors
    /// come back as `Other` with the daemon's message
    pub fn request(&self, command: Command) -> Result<ResponseData> {
        self.send_command(command)?
            .result
            .map_err(ShepherdError::Other)
    }

    /// True when a daemon answers on the socket
    pub fn is_daemon_running(&self) -> bool {
        self.connect().is_ok()
    }

    fn try_send_request(&self, request: &Request) -> Result<Response> {
        let mut stream = self.connect()?;

        let request_json = serde_json::to_string(request).map_err(|e| {
            ShepherdError::Serialization(format!("Failed to serialize request: {}", e))
        })?;

        writeln!(stream, "{}", request_json)
            .map_err(|e| ShepherdError::Ipc(format!("Failed to write request: {}", e)))?;
        stream
            .flush()
            .map_err(|e| ShepherdError::Ipc(format!("Failed to flush stream: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .map_err(|e| ShepherdError::Ipc(format!("Failed to read response: {}", e)))?;

        serde_json::from_str(&response_line).map_err(|e| {
            ShepherdError::Protocol(format!("Failed to deserialize response: {}", e))
        })
    }

    fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(ShepherdError::DaemonNotRunning);
        }

        UnixStream::connect(&self.socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                ShepherdError::DaemonNotRunning
            } else {
                ShepherdError::Connection(format!("Failed to connect to daemon: {}", e))
            }
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_with_custom_path() {
        let client = IpcClient::with_socket_path("/tmp/custom.sock");
        assert_eq!(client.socket_path(), Path::new("/tmp/custom.sock"));
    }

    #[test]
    fn test_daemon_not_running_error() {
        let client = IpcClient::with_socket_path("/tmp/shepherd-nonexistent.sock");
        let result = client.send_command(Command::Status { name: None });
        assert!(matches!(result, Err(ShepherdError::DaemonNotRunning)));
        assert!(!client.is_daemon_running());
    }

    #[test]
    fn test_request_ids_increase() {
        let client = IpcClient::with_socket_path("/tmp/shepherd-nonexistent.sock");
        let _ = client.send_command(Command::Status { name: None });
        let _ = client.send_command(Command::Status { name: None });
        assert_eq!(client.request_id.load(Ordering::SeqCst), 3);
    }
}
