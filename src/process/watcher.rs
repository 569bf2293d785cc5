use crate::config::ApplicationSpec;
use crate::error::{Result, ShepherdError};
use crate::process::controller::Control;
use crate::process::supervisor::SupervisorState;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Quiet period that must follow the last change before instances restart
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches an application's working directory and restarts its instances on change
pub struct AppWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl AppWatcher {
    pub(crate) fn start(
        spec: &ApplicationSpec,
        state: Arc<RwLock<SupervisorState>>,
    ) -> Result<Self> {
        let filter = ChangeFilter::new(spec);
        let (tx, rx) = mpsc::channel::<Event>(256);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    // Dropping events is fine: one is enough to trigger a restart
                    let _ = tx.try_send(event);
                }
            },
            Config::default(),
        )
        .map_err(|e| ShepherdError::Watch(e.to_string()))?;

        watcher
            .watch(&spec.cwd, RecursiveMode::Recursive)
            .map_err(|e| {
                ShepherdError::Watch(format!("Failed to watch {}: {}", spec.cwd.display(), e))
            })?;

        tracing::info!(app = %spec.name, path = %spec.cwd.display(), "Watching for file changes");

        let task = tokio::spawn(debounce_changes(spec.name.clone(), filter, rx, state));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for AppWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn debounce_changes(
    app: String,
    filter: ChangeFilter,
    mut rx: mpsc::Receiver<Event>,
    state: Arc<RwLock<SupervisorState>>,
) {
    while let Some(event) = rx.recv().await {
        if !filter.is_relevant(&event) {
            continue;
        }

        // Absorb the burst that usually follows a save
        loop {
            match tokio::time::timeout(WATCH_DEBOUNCE, rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        tracing::info!(app = %app, "File change detected");
        let controls = state.read().await.app_controls(&app);
        for control in controls {
            let _ = control.try_send(Control::FilesChanged);
        }
    }
}

/// Decides which filesystem events count as a change of the application
struct ChangeFilter {
    root: PathBuf,
    ignore: Vec<String>,
    logs: Vec<PathBuf>,
}

impl ChangeFilter {
    fn new(spec: &ApplicationSpec) -> Self {
        Self {
            root: spec.cwd.clone(),
            ignore: spec.ignore_watch.clone(),
            logs: spec.logs.iter().map(Path::to_path_buf).collect(),
        }
    }

    fn is_relevant(&self, event: &Event) -> bool {
        let kind_matters = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        );
        kind_matters && event.paths.iter().any(|path| !self.is_ignored(path))
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if self.logs.iter().any(|log| is_log_file(log, path)) {
            return true;
        }

        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative.components().any(|component| {
            let component = component.as_os_str().to_string_lossy();
            self.ignore.iter().any(|pattern| matches_pattern(pattern, &component))
        })
    }
}

/// The log file itself or one of its rotated siblings
fn is_log_file(log: &Path, path: &Path) -> bool {
    if path == log {
        return true;
    }
    let stem = log.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    path.parent() == log.parent()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| !stem.is_empty() && name.starts_with(stem) && name.ends_with(".log"))
}

/// Exact name, `*suffix` or `prefix*`
fn matches_pattern(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        name == pattern
    }
}
