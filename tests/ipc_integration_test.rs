// Integration tests for the IPC server and the synchronous client

use shepherd::error::ShepherdError;
use shepherd::ipc::{Command, DaemonCommand, IpcClient, IpcServer, ResponseData};
use tempfile::TempDir;
use tokio::sync::oneshot;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_server_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("shepherd.sock");

    let mut server = IpcServer::with_socket_path(&socket_path);
    server.start().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        server
            .run(
                |command| async move {
                    match command {
                        Command::Status { name: Some(name) } => {
                            Err(ShepherdError::AppNotFound(name))
                        }
                        Command::Daemon(DaemonCommand::Status) => Ok(ResponseData::DaemonStatus {
                            pid: 42,
                            uptime: std::time::Duration::from_secs(3),
                            apps: 0,
                        }),
                        _ => Ok(ResponseData::Success("ok".to_string())),
                    }
                },
                async {
                    let _ = stop_rx.await;
                },
            )
            .await
    });

    let client_path = socket_path.clone();
    let responses = tokio::task::spawn_blocking(move || {
        let client = IpcClient::with_socket_path(&client_path);
        let daemon = client.request(Command::Daemon(DaemonCommand::Status));
        let missing = client.request(Command::Status {
            name: Some("ghost".to_string()),
        });
        let generic = client.send_command(Command::Stop {
            name: "api".to_string(),
        });
        (daemon, missing, generic)
    })
    .await
    .unwrap();

    let (daemon, missing, generic) = responses;
    assert!(matches!(
        daemon.unwrap(),
        ResponseData::DaemonStatus { pid: 42, apps: 0, .. }
    ));

    match missing {
        Err(ShepherdError::Other(message)) => assert!(message.contains("ghost")),
        other => panic!("expected daemon-side error, got {:?}", other),
    }

    let generic = generic.unwrap();
    assert_eq!(generic.id, 3);
    assert_eq!(generic.result, Ok(ResponseData::Success("ok".to_string())));

    stop_tx.send(()).unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_request_gets_error_response() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("shepherd.sock");

    let mut server = IpcServer::with_socket_path(&socket_path);
    server.start().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        server
            .run(
                |_| async { Ok(ResponseData::Success("ok".to_string())) },
                async {
                    let _ = stop_rx.await;
                },
            )
            .await
    });

    let mut stream = UnixStream::connect(&socket_path).await.unwrap();
    stream.write_all(b"this is not json\n").await.unwrap();

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).await.unwrap();
    let response: shepherd::ipc::Response = serde_json::from_str(&line).unwrap();
    assert_eq!(response.id, 0);
    assert!(response.result.unwrap_err().contains("Malformed request"));

    stop_tx.send(()).unwrap();
    server_task.await.unwrap().unwrap();
}

#[test]
fn test_client_without_daemon() {
    let temp_dir = TempDir::new().unwrap();
    let client = IpcClient::with_socket_path(temp_dir.path().join("shepherd.sock"));
    assert!(!client.is_daemon_running());
    assert!(matches!(
        client.request(Command::Status { name: None }),
        Err(ShepherdError::DaemonNotRunning)
    ));
}
