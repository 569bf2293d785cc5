// The daemon process: supervisor, IPC endpoint and persisted state

use crate::config::{DaemonSettings, Descriptor, DescriptorFormat, SupervisorConfig};
use crate::error::{Result, ShepherdError};
use crate::ipc::{Command, DaemonCommand, IpcServer, ResponseData, StartFailure, StartOptions};
use crate::logs::read_app_logs;
use crate::process::Supervisor;
use crate::state::{DaemonState, PersistedApp, StateStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{error, info, warn};

pub struct Daemon {
    supervisor: Supervisor,
    settings: DaemonSettings,
    store: StateStore,
    started_at: Instant,
    stop_requested: Notify,
}

impl Daemon {
    /// Must be called inside a tokio runtime
    pub fn new(settings: DaemonSettings, config: SupervisorConfig) -> Self {
        Self::with_supervisor(settings, Supervisor::new(config))
    }

    pub fn with_supervisor(settings: DaemonSettings, supervisor: Supervisor) -> Self {
        let store = StateStore::new(&settings.state_file);
        Self {
            supervisor,
            settings,
            store,
            started_at: Instant::now(),
            stop_requested: Notify::new(),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Serve requests until SIGTERM, SIGINT or a `daemon stop` request, then
    /// save state and stop every application.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.settings.ensure_dirs()?;
        self.resurrect().await;

        let mut server = IpcServer::with_socket_path(&self.settings.socket_path);
        server.start()?;
        info!(socket = %self.settings.socket_path.display(), "Daemon listening");

        let shutdown = self.shutdown_signal()?;
        let daemon = Arc::clone(&self);
        let result = server
            .run(
                move |command| {
                    let daemon = Arc::clone(&daemon);
                    async move { daemon.handle_command(command).await }
                },
                shutdown,
            )
            .await;

        server.stop()?;
        self.shutdown().await;
        result
    }

    #[cfg(unix)]
    fn shutdown_signal(&self) -> Result<impl std::future::Future<Output = ()> + '_> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        Ok(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = self.stop_requested.notified() => info!("Stop requested by client"),
            }
        })
    }

    #[cfg(not(unix))]
    fn shutdown_signal(&self) -> Result<impl std::future::Future<Output = ()> + '_> {
        Ok(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                _ = self.stop_requested.notified() => info!("Stop requested by client"),
            }
        })
    }

    /// Ask a running `run` loop to shut down
    pub fn request_stop(&self) {
        self.stop_requested.notify_one();
    }

    /// Map one client command onto the supervisor
    pub async fn handle_command(&self, command: Command) -> Result<ResponseData> {
        match command {
            Command::Start(options) => self.start(options).await,
            Command::Stop { name } => Ok(ResponseData::Stopped(self.supervisor.stop(&name).await?)),
            Command::Restart { name } => Ok(ResponseData::Restarted(
                self.supervisor.restart(&name).await?,
            )),
            Command::Reload { name } => self.reload(&name).await,
            Command::Status { name } => Ok(ResponseData::Status(
                self.supervisor.status(name.as_deref()).await?,
            )),
            Command::Logs(options) => {
                let (spec, _) = self.supervisor.spec(&options.name).await?;
                let path = options.selection.path(&spec.logs).to_path_buf();
                let lines = read_app_logs(&spec.logs, options.selection, options.lines).await?;
                Ok(ResponseData::Logs { path, lines })
            }
            Command::Delete { name } => {
                self.supervisor.delete(&name).await?;
                Ok(ResponseData::Deleted { name })
            }
            Command::Daemon(DaemonCommand::Status) => Ok(ResponseData::DaemonStatus {
                pid: std::process::id(),
                uptime: self.started_at.elapsed(),
                apps: self.supervisor.summaries().await.len(),
            }),
            Command::Daemon(DaemonCommand::Stop) => {
                // The accept loop ends; this connection's task still answers
                self.request_stop();
                Ok(ResponseData::Success("Daemon shutting down".to_string()))
            }
        }
    }

    /// `start <descriptor>` registers and starts its entries; `start <name>`
    /// starts an already registered application
    async fn start(&self, options: StartOptions) -> Result<ResponseData> {
        let path = Path::new(&options.target);
        if DescriptorFormat::from_path(path).is_err() || !path.is_file() {
            let handles = self.supervisor.start(&options.target).await?;
            return Ok(ResponseData::Started {
                handles,
                skipped: Vec::new(),
                failed: Vec::new(),
            });
        }

        let descriptor = Descriptor::from_file(path, &self.settings.log_dir)?;
        let wanted = |name: &str| options.only.as_deref().map_or(true, |only| only == name);

        if let Some(only) = options.only.as_deref() {
            let known = descriptor.find(only).is_some()
                || descriptor.rejected.iter().any(|r| r.name == only);
            if !known {
                return Err(ShepherdError::AppNotFound(only.to_string()));
            }
        }

        let mut handles = Vec::new();
        let mut skipped = Vec::new();
        let mut failed: Vec<StartFailure> = descriptor
            .rejected
            .iter()
            .filter(|rejected| wanted(&rejected.name))
            .map(|rejected| StartFailure {
                name: rejected.name.clone(),
                error: rejected.error.to_string(),
            })
            .collect();

        for spec in descriptor.apps.iter().filter(|spec| wanted(&spec.name)) {
            let name = spec.name.clone();
            if !self
                .supervisor
                .register(spec.clone(), descriptor.source.clone())
                .await?
            {
                info!(app = %name, "Application already running, skipped");
                skipped.push(name);
                continue;
            }

            match self.supervisor.start(&name).await {
                Ok(started) => handles.extend(started),
                Err(e) => {
                    warn!(app = %name, error = %e, "Failed to start application");
                    failed.push(StartFailure {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(ResponseData::Started {
            handles,
            skipped,
            failed,
        })
    }

    /// Re-read the application's descriptor, when it has one, and reload
    async fn reload(&self, name: &str) -> Result<ResponseData> {
        let (current, source) = self.supervisor.spec(name).await?;

        let spec = match source {
            Some(source) => {
                let descriptor = Descriptor::from_file(&source, &self.settings.log_dir)?;
                if let Some(rejected) = descriptor.rejected.into_iter().find(|r| r.name == name) {
                    return Err(rejected.error);
                }
                descriptor
                    .apps
                    .into_iter()
                    .find(|spec| spec.name == name)
                    .ok_or_else(|| {
                        ShepherdError::Config(format!(
                            "Application '{}' is no longer in {}",
                            name,
                            source.display()
                        ))
                    })?
            }
            None => current.as_ref().clone(),
        };

        Ok(ResponseData::Reloaded(self.supervisor.reload(spec).await?))
    }

    /// Register every saved application and start those that were running
    pub async fn resurrect(&self) {
        let state = match self.store.load() {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Failed to load saved state, starting empty");
                return;
            }
        };

        if !state.apps.is_empty() {
            info!(count = state.apps.len(), "Restoring saved applications");
        }

        for app in state.apps {
            let name = app.spec.name.clone();
            if let Err(e) = self.supervisor.register(app.spec, app.source).await {
                warn!(app = %name, error = %e, "Failed to restore application");
                continue;
            }
            if app.running {
                if let Err(e) = self.supervisor.start(&name).await {
                    warn!(app = %name, error = %e, "Failed to restart restored application");
                }
            }
        }
    }

    /// Save what is registered (and what runs), then stop everything
    pub async fn shutdown(&self) {
        info!("Shutting down daemon");

        let apps = self
            .supervisor
            .summaries()
            .await
            .into_iter()
            .map(|summary| PersistedApp {
                spec: summary.spec.as_ref().clone(),
                source: summary.source,
                running: summary.running,
            })
            .collect();

        match self.store.save(&DaemonState::new(apps)) {
            Ok(()) => info!(path = %self.store.path().display(), "Daemon state saved"),
            Err(e) => error!(error = %e, "Failed to save daemon state"),
        }

        self.supervisor.shutdown().await;
        info!("Daemon shutdown complete");
    }
}
