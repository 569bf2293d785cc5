use crate::config::ApplicationSpec;
use crate::error::{Result, ShepherdError};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Environment variable carrying the application name into the child
pub const ENV_APP_NAME: &str = "SHEPHERD_APP";
/// Environment variable carrying the instance index into the child
pub const ENV_INSTANCE: &str = "SHEPHERD_INSTANCE";

/// A freshly started child
#[derive(Debug)]
pub struct SpawnedProcess {
    pub child: Child,
    pub pid: u32,
}

/// Start one instance of an application.
///
/// The child runs `interpreter script args...` (or `script args...` without
/// an interpreter) in the application's `cwd`, with the supervisor's
/// environment overlaid by the application's `env`. stdout and stderr are
/// piped for the log router; stdin is closed.
pub fn launch(spec: &ApplicationSpec, instance: usize) -> Result<SpawnedProcess> {
    let launch_error = |reason: String| ShepherdError::Launch {
        app: spec.name.clone(),
        reason,
    };

    let mut command = match &spec.interpreter {
        Some(interpreter) => {
            let mut command = Command::new(interpreter);
            command.arg(&spec.script);
            command
        }
        None => Command::new(&spec.script),
    };

    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .env(ENV_APP_NAME, &spec.name)
        .env(ENV_INSTANCE, instance.to_string())
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| launch_error(e.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| launch_error("process exited before its pid was read".to_string()))?;

    tracing::debug!(app = %spec.name, instance, pid, "Launched process");

    Ok(SpawnedProcess { child, pid })
}

#[cfg(unix)]
pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(ShepherdError::Signal(format!(
            "Unsupported signal: {}",
            signal_name
        ))),
    }
}

/// Ask a child to exit with `signal_name`, wait up to `grace`, then force-kill.
///
/// Returns the exit status once the child is confirmed gone.
pub async fn terminate_gracefully(
    child: &mut Child,
    signal_name: &str,
    grace: Duration,
) -> Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let signal = parse_signal(signal_name).unwrap_or(Signal::SIGTERM);
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), signal) {
                tracing::debug!(pid, error = %e, "Failed to signal process");
            }
        }
    }

    #[cfg(not(unix))]
    let _ = signal_name;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            tracing::warn!(
                pid = child.id(),
                grace = ?grace,
                "Process did not exit within grace period, killing"
            );
            child.start_kill()?;
            Ok(child.wait().await?)
        }
    }
}
