// Integration tests for the daemon's command handling and state persistence

use shepherd::config::{DaemonSettings, SupervisorConfig};
use shepherd::daemon::Daemon;
use shepherd::ipc::{Command, DaemonCommand, LogOptions, ResponseData, StartOptions};
use shepherd::logs::LogSelection;
use shepherd::process::LifecycleState;
use shepherd::state::StateStore;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn write_descriptor(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("apps.json");
    std::fs::write(&path, body).unwrap();
    path
}

fn start(target: &Path, only: Option<&str>) -> Command {
    Command::Start(StartOptions {
        target: target.to_string_lossy().into_owned(),
        only: only.map(str::to_string),
    })
}

const TWO_APPS: &str = r#"{ "apps": [
    { "name": "api", "script": "/bin/sh", "args": ["-c", "echo api up; exec sleep 30"] },
    { "name": "worker", "script": "/bin/sh", "args": ["-c", "exec sleep 30"] },
    { "name": "ghost", "script": "missing.sh" }
] }"#;

#[tokio::test]
async fn test_start_descriptor_registers_and_reports_failures() {
    let home = TempDir::new().unwrap();
    let descriptor = write_descriptor(home.path(), TWO_APPS);
    let daemon = Daemon::new(DaemonSettings::with_home(home.path()), SupervisorConfig::default());

    let response = daemon.handle_command(start(&descriptor, None)).await.unwrap();
    match response {
        ResponseData::Started {
            handles,
            skipped,
            failed,
        } => {
            assert_eq!(handles.len(), 2);
            assert!(handles.iter().all(|h| h.state == LifecycleState::Running));
            assert!(skipped.is_empty());
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].name, "ghost");
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // Entries still running are skipped on a second start
    let again = daemon.handle_command(start(&descriptor, None)).await.unwrap();
    match again {
        ResponseData::Started { skipped, .. } => assert_eq!(skipped, vec!["api", "worker"]),
        other => panic!("unexpected response: {:?}", other),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_start_only_one_entry() {
    let home = TempDir::new().unwrap();
    let descriptor = write_descriptor(home.path(), TWO_APPS);
    let daemon = Daemon::new(DaemonSettings::with_home(home.path()), SupervisorConfig::default());

    daemon
        .handle_command(start(&descriptor, Some("worker")))
        .await
        .unwrap();
    let status = daemon
        .handle_command(Command::Status { name: None })
        .await
        .unwrap();
    match status {
        ResponseData::Status(handles) => {
            assert_eq!(handles.len(), 1);
            assert_eq!(handles[0].app, "worker");
        }
        other => panic!("unexpected response: {:?}", other),
    }

    assert!(daemon
        .handle_command(start(&descriptor, Some("nobody")))
        .await
        .is_err());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_logs_reload_and_delete() {
    let home = TempDir::new().unwrap();
    let descriptor = write_descriptor(home.path(), TWO_APPS);
    let daemon = Daemon::new(DaemonSettings::with_home(home.path()), SupervisorConfig::default());
    daemon
        .handle_command(start(&descriptor, Some("api")))
        .await
        .unwrap();

    let logs = Command::Logs(LogOptions {
        name: "api".to_string(),
        lines: 10,
        selection: LogSelection::Out,
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match daemon.handle_command(logs.clone()).await.unwrap() {
            ResponseData::Logs { lines, path } if !lines.is_empty() => {
                assert_eq!(lines, vec!["api up"]);
                assert!(path.ends_with("api-out.log"));
                break;
            }
            _ if Instant::now() < deadline => tokio::time::sleep(Duration::from_millis(50)).await,
            other => panic!("no log output: {:?}", other),
        }
    }

    // Reload picks up the edited descriptor
    write_descriptor(
        home.path(),
        r#"{ "apps": [
            { "name": "api", "script": "/bin/sh", "args": ["-c", "exec sleep 30"], "instances": 2 }
        ] }"#,
    );
    match daemon
        .handle_command(Command::Reload {
            name: "api".to_string(),
        })
        .await
        .unwrap()
    {
        ResponseData::Reloaded(handles) => assert_eq!(handles.len(), 2),
        other => panic!("unexpected response: {:?}", other),
    }

    daemon
        .handle_command(Command::Delete {
            name: "api".to_string(),
        })
        .await
        .unwrap();
    assert!(daemon
        .handle_command(Command::Status {
            name: Some("api".to_string()),
        })
        .await
        .is_err());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_saves_state_and_resurrects() {
    let home = TempDir::new().unwrap();
    let descriptor = write_descriptor(home.path(), TWO_APPS);
    let settings = DaemonSettings::with_home(home.path());

    {
        let daemon = Daemon::new(settings.clone(), SupervisorConfig::default());
        daemon.handle_command(start(&descriptor, None)).await.unwrap();
        daemon
            .handle_command(Command::Stop {
                name: "worker".to_string(),
            })
            .await
            .unwrap();
        daemon.shutdown().await;
    }

    let saved = StateStore::new(&settings.state_file).load().unwrap();
    let running: Vec<(&str, bool)> = saved
        .apps
        .iter()
        .map(|app| (app.spec.name.as_str(), app.running))
        .collect();
    assert_eq!(running, vec![("api", true), ("worker", false)]);

    let daemon = Daemon::new(settings, SupervisorConfig::default());
    daemon.resurrect().await;

    let handles = daemon.supervisor().status(None).await.unwrap();
    let api: Vec<_> = handles.iter().filter(|h| h.app == "api").collect();
    let worker: Vec<_> = handles.iter().filter(|h| h.app == "worker").collect();
    assert_eq!(api.len(), 1);
    assert_eq!(api[0].state, LifecycleState::Running);
    assert!(worker.is_empty());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_daemon_status_and_stop_request() {
    let home = TempDir::new().unwrap();
    let daemon = Daemon::new(DaemonSettings::with_home(home.path()), SupervisorConfig::default());

    match daemon
        .handle_command(Command::Daemon(DaemonCommand::Status))
        .await
        .unwrap()
    {
        ResponseData::DaemonStatus { pid, apps, .. } => {
            assert_eq!(pid, std::process::id());
            assert_eq!(apps, 0);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    assert!(matches!(
        daemon
            .handle_command(Command::Daemon(DaemonCommand::Stop))
            .await
            .unwrap(),
        ResponseData::Success(_)
    ));
}
