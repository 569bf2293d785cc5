use shepherd::config::{DaemonSettings, SupervisorConfig};
use shepherd::daemon::{daemonize, Daemon, DaemonManager};
use shepherd::error::Result;
use std::env;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let should_daemonize = env::args().any(|arg| arg == "--daemonize");

    // The daemon changes directory to `/`, so pin the home first
    let home = env::current_dir()?.join(DaemonSettings::from_env().home);
    let settings = DaemonSettings::with_home(home);
    settings.ensure_dirs()?;

    // Before the runtime exists: only the forking thread survives a fork
    if should_daemonize {
        daemonize(&settings.daemon_log)?;
    }

    init_tracing(!should_daemonize);

    let manager = DaemonManager::new(settings.clone());
    manager.register()?;
    tracing::info!(pid = std::process::id(), home = %settings.home.display(), "Starting shepherd daemon");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async {
        let daemon = Arc::new(Daemon::new(settings, SupervisorConfig::from_env()));
        daemon.run().await
    });

    if let Err(e) = &result {
        tracing::error!(error = %e, "Daemon exited with an error");
    }

    manager.unregister()?;
    result
}

/// `RUST_LOG` filter, `info` by default; no colors when writing to daemon.log
fn init_tracing(ansi: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(ansi))
        .init();
}
