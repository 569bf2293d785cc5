// Detach the daemon from the launching terminal

use crate::error::{Result, ShepherdError};
use std::path::Path;

/// Double-fork into a new session, chdir to `/`, point stdin at /dev/null
/// and stdout/stderr at `log_path`.
///
/// Must run before the tokio runtime starts: forking a multi-threaded
/// process only keeps the calling thread.
#[cfg(unix)]
pub fn daemonize(log_path: &Path) -> Result<()> {
    use nix::libc;
    use nix::unistd::{fork, setsid, ForkResult};
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    let fork_error = |stage: &str, e: nix::Error| {
        ShepherdError::Other(format!("{} fork failed: {}", stage, e))
    };

    // SAFETY: called while the process is still single-threaded
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(fork_error("First", e)),
    }

    setsid().map_err(|e| ShepherdError::Other(format!("setsid failed: {}", e)))?;

    // The session leader exits so the daemon can never reacquire a terminal
    // SAFETY: still single-threaded
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(fork_error("Second", e)),
    }

    std::env::set_current_dir("/")
        .map_err(|e| ShepherdError::Other(format!("Failed to change directory to /: {}", e)))?;

    let devnull = OpenOptions::new().read(true).open("/dev/null")?;
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    // SAFETY: both descriptors are open for the duration of the calls
    unsafe {
        libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(log.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(log.as_raw_fd(), libc::STDERR_FILENO);
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(_log_path: &Path) -> Result<()> {
    Err(ShepherdError::Other(
        "Daemonization is only supported on Unix systems".to_string(),
    ))
}
