// CLI module - User-facing command-line interface

mod output;

use crate::config::{DaemonSettings, DescriptorFormat};
use crate::daemon::DaemonManager;
use crate::error::{Result, ShepherdError};
use crate::ipc::{Command, DaemonCommand, IpcClient, LogOptions, ResponseData, StartOptions};
use crate::logs::{LogSelection, DEFAULT_LOG_LINES};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::time::Duration;

/// How long `daemon start` waits for the socket to appear
const DAEMON_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `daemon stop` waits before escalating to SIGKILL
const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shepherd - keeps long-running applications alive
#[derive(Parser)]
#[command(name = "shepherd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the applications of a descriptor file, or a registered application
    Start {
        /// Descriptor file (.json, .toml, .yaml) or application name
        target: String,

        /// Only start this entry of the descriptor
        #[arg(long)]
        only: Option<String>,
    },

    /// Stop every instance of an application
    Stop { name: String },

    /// Restart an application and reset its restart count
    Restart { name: String },

    /// Re-read an application's descriptor and restart it with the new settings
    Reload { name: String },

    /// Show instance status
    #[command(visible_aliases = ["list", "ls"])]
    Status {
        /// Limit to one application
        name: Option<String>,
    },

    /// Show the last lines of an application's logs
    Logs {
        name: String,

        /// Number of lines to display
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,

        /// Read the stdout log instead of the combined one
        #[arg(long, conflicts_with = "err")]
        out: bool,

        /// Read the stderr log instead of the combined one
        #[arg(long)]
        err: bool,
    },

    /// Stop an application and forget it
    Delete { name: String },

    /// Manage the daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon in the background
    Start,
    /// Stop the daemon and every application it supervises
    Stop,
    /// Check daemon status
    Status,
}

impl Cli {
    /// Parse arguments and run the command
    pub fn run() -> Result<()> {
        Cli::parse().execute(&DaemonSettings::from_env())
    }

    fn execute(&self, settings: &DaemonSettings) -> Result<()> {
        if let Commands::Daemon { command } = &self.command {
            return Self::execute_daemon(command, settings);
        }

        let command = self.build_command()?;
        if matches!(command, Command::Start(_)) {
            ensure_daemon(settings)?;
        }

        let client = IpcClient::with_socket_path(&settings.socket_path);
        match client.send_command(command)?.result {
            Ok(data) => {
                output::print_success(&data);
                match data {
                    ResponseData::Started { failed, .. } if !failed.is_empty() => {
                        Err(ShepherdError::Other(format!(
                            "{} application(s) failed to start",
                            failed.len()
                        )))
                    }
                    _ => Ok(()),
                }
            }
            Err(message) => Err(ShepherdError::Other(message)),
        }
    }

    fn execute_daemon(command: &DaemonCommands, settings: &DaemonSettings) -> Result<()> {
        let manager = DaemonManager::new(settings.clone());

        match command {
            DaemonCommands::Start => {
                if manager.is_running() {
                    output::print_info("Daemon is already running");
                    return Ok(());
                }
                launch_daemon(&manager)
            }
            DaemonCommands::Stop => {
                let spinner = output::create_progress_bar("Stopping daemon...");
                match manager.stop(DAEMON_STOP_TIMEOUT) {
                    Ok(pid) => {
                        output::finish_progress_success(
                            spinner,
                            &format!("Daemon stopped (PID: {})", pid),
                        );
                        Ok(())
                    }
                    Err(e) => {
                        output::finish_progress_error(spinner, "Failed to stop daemon");
                        Err(e)
                    }
                }
            }
            DaemonCommands::Status => {
                let status = manager.status();
                if !status.running {
                    output::print_daemon_stopped(&status);
                    return Ok(());
                }
                let client = IpcClient::with_socket_path(&settings.socket_path);
                match client.request(Command::Daemon(DaemonCommand::Status)) {
                    Ok(data) => output::print_success(&data),
                    // Alive but not answering, e.g. still starting up
                    Err(_) => output::print_daemon_unreachable(&status),
                }
                Ok(())
            }
        }
    }

    fn build_command(&self) -> Result<Command> {
        let command = match &self.command {
            Commands::Start { target, only } => Command::Start(StartOptions {
                target: resolve_target(target)?,
                only: only.clone(),
            }),
            Commands::Stop { name } => Command::Stop { name: name.clone() },
            Commands::Restart { name } => Command::Restart { name: name.clone() },
            Commands::Reload { name } => Command::Reload { name: name.clone() },
            Commands::Status { name } => Command::Status { name: name.clone() },
            Commands::Logs {
                name,
                lines,
                out,
                err,
            } => Command::Logs(LogOptions {
                name: name.clone(),
                lines: *lines,
                selection: log_selection(*out, *err),
            }),
            Commands::Delete { name } => Command::Delete { name: name.clone() },
            Commands::Daemon { .. } => {
                return Err(ShepherdError::Other(
                    "daemon commands are not sent over IPC".to_string(),
                ))
            }
        };
        Ok(command)
    }
}

/// Descriptor paths are made absolute because the daemon runs from `/`;
/// anything without a descriptor extension is taken as an application name
fn resolve_target(target: &str) -> Result<String> {
    let path = Path::new(target);
    if DescriptorFormat::from_path(path).is_err() {
        return Ok(target.to_string());
    }
    if path.is_file() {
        let absolute = path.canonicalize()?;
        return Ok(absolute.to_string_lossy().into_owned());
    }
    Err(ShepherdError::Config(format!(
        "Descriptor not found: {}",
        target
    )))
}

fn log_selection(out: bool, err: bool) -> LogSelection {
    match (out, err) {
        (true, _) => LogSelection::Out,
        (_, true) => LogSelection::Err,
        _ => LogSelection::Combined,
    }
}

fn ensure_daemon(settings: &DaemonSettings) -> Result<()> {
    let manager = DaemonManager::new(settings.clone());
    if manager.is_running() {
        return Ok(());
    }
    launch_daemon(&manager)
}

fn launch_daemon(manager: &DaemonManager) -> Result<()> {
    let spinner = output::create_progress_bar("Starting daemon...");
    let result = manager
        .launch()
        .and_then(|()| manager.wait_ready(DAEMON_READY_TIMEOUT));

    match &result {
        Ok(()) => output::finish_progress_success(spinner, "Daemon started"),
        Err(_) => output::finish_progress_error(spinner, "Failed to start daemon"),
    }
    result
}
