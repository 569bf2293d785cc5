use crate::config::{ApplicationSpec, SupervisorConfig};
use crate::error::{Result, ShepherdError};
use crate::logs::LogRouter;
use crate::process::controller::{Control, InstanceController, CONTROL_QUEUE};
use crate::process::monitor::{run_monitor, MemorySampler, MemoryTarget, SysinfoSampler};
use crate::process::types::{InstanceId, LifecycleState, ProcessHandle};
use crate::process::watcher::AppWatcher;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long `start` waits for each instance's first launch attempt
const LAUNCH_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// One instance position of an application
struct InstanceSlot {
    handle: ProcessHandle,
    control: mpsc::Sender<Control>,
    task: Option<JoinHandle<()>>,
}

impl InstanceSlot {
    fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

struct AppEntry {
    spec: Arc<ApplicationSpec>,
    source: Option<PathBuf>,
    instances: Vec<InstanceSlot>,
    logs: Option<Arc<LogRouter>>,
    watcher: Option<AppWatcher>,
}

impl AppEntry {
    fn new(spec: ApplicationSpec, source: Option<PathBuf>) -> Self {
        Self {
            spec: Arc::new(spec),
            source,
            instances: Vec::new(),
            logs: None,
            watcher: None,
        }
    }

    fn is_live(&self) -> bool {
        self.instances.iter().any(InstanceSlot::is_live)
    }

    fn handles(&self) -> Vec<ProcessHandle> {
        self.instances.iter().map(|slot| slot.handle.clone()).collect()
    }

    fn live_controls(&self) -> Vec<mpsc::Sender<Control>> {
        self.instances
            .iter()
            .filter(|slot| slot.is_live())
            .map(|slot| slot.control.clone())
            .collect()
    }
}

/// Registry of applications and their instances.
///
/// Lives behind the supervisor's single `RwLock`; only the supervisor and
/// the instance controllers mutate it.
pub(crate) struct SupervisorState {
    apps: BTreeMap<String, AppEntry>,
    next_id: u64,
}

impl SupervisorState {
    fn new() -> Self {
        Self {
            apps: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> InstanceId {
        let id = InstanceId(self.next_id);
        self.next_id += 1;
        id
    }

    fn entry(&self, name: &str) -> Result<&AppEntry> {
        self.apps
            .get(name)
            .ok_or_else(|| ShepherdError::AppNotFound(name.to_string()))
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut AppEntry> {
        self.apps
            .get_mut(name)
            .ok_or_else(|| ShepherdError::AppNotFound(name.to_string()))
    }

    /// Handle of a live slot; unknown ids (replaced slots) yield `None`
    pub(crate) fn handle_mut(&mut self, id: InstanceId) -> Option<&mut ProcessHandle> {
        self.apps
            .values_mut()
            .flat_map(|entry| entry.instances.iter_mut())
            .find(|slot| slot.handle.id == id)
            .map(|slot| &mut slot.handle)
    }

    pub(crate) fn memory_targets(&self) -> Vec<MemoryTarget> {
        let mut targets = Vec::new();
        for entry in self.apps.values() {
            for slot in &entry.instances {
                if slot.handle.state != LifecycleState::Running {
                    continue;
                }
                if let Some(pid) = slot.handle.pid {
                    targets.push(MemoryTarget {
                        app: entry.spec.name.clone(),
                        instance: slot.handle.instance,
                        id: slot.handle.id,
                        pid,
                        limit: entry.spec.max_memory_restart,
                        control: slot.control.clone(),
                    });
                }
            }
        }
        targets
    }

    pub(crate) fn record_memory(&mut self, id: InstanceId, pid: u32, rss: u64) {
        if let Some(handle) = self.handle_mut(id) {
            if handle.pid == Some(pid) {
                handle.memory = rss;
            }
        }
    }

    pub(crate) fn app_controls(&self, app: &str) -> Vec<mpsc::Sender<Control>> {
        self.apps
            .get(app)
            .map(AppEntry::live_controls)
            .unwrap_or_default()
    }
}

/// A registered application, as persisted across daemon restarts
#[derive(Debug, Clone)]
pub struct AppSummary {
    pub spec: Arc<ApplicationSpec>,
    pub source: Option<PathBuf>,
    pub running: bool,
}

/// Control surface over all supervised applications.
///
/// Operations are serialized by an internal lock, so a `reload` is never
/// interleaved with another `start` or `stop` of the same application. The
/// state lock is only held for bookkeeping, never while waiting on a child.
pub struct Supervisor {
    state: Arc<RwLock<SupervisorState>>,
    ops: Mutex<()>,
    config: SupervisorConfig,
    monitor: JoinHandle<()>,
}

impl Supervisor {
    /// Create a supervisor sampling memory through sysinfo
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_sampler(config, Box::new(SysinfoSampler::new()))
    }

    /// Create a supervisor with a custom memory sampler. Must be called
    /// inside a tokio runtime.
    pub fn with_sampler(config: SupervisorConfig, sampler: Box<dyn MemorySampler>) -> Self {
        let state = Arc::new(RwLock::new(SupervisorState::new()));
        let monitor = tokio::spawn(run_monitor(state.clone(), sampler, config.poll_interval));

        Self {
            state,
            ops: Mutex::new(()),
            config,
            monitor,
        }
    }

    /// Register an application, or replace the spec of a stopped one.
    ///
    /// Returns false (and changes nothing) when the application already has
    /// live instances.
    pub async fn register(&self, spec: ApplicationSpec, source: Option<PathBuf>) -> Result<bool> {
        let _ops = self.ops.lock().await;
        let mut state = self.state.write().await;

        match state.apps.get_mut(&spec.name) {
            Some(entry) if entry.is_live() => Ok(false),
            Some(entry) => {
                entry.spec = Arc::new(spec);
                entry.source = source;
                Ok(true)
            }
            None => {
                info!(app = %spec.name, "Registered application");
                state
                    .apps
                    .insert(spec.name.clone(), AppEntry::new(spec, source));
                Ok(true)
            }
        }
    }

    /// Start every instance of an application. Starting an application that
    /// is already running is a no-op.
    ///
    /// Fails with `LogSink` when a sink cannot be opened (nothing is started)
    /// and with `Launch` when a first launch attempt fails (the instance then
    /// follows its restart policy).
    pub async fn start(&self, name: &str) -> Result<Vec<ProcessHandle>> {
        let _ops = self.ops.lock().await;
        self.start_locked(name).await?;
        self.status(Some(name)).await
    }

    /// Stop every instance of an application; stopped instances never restart
    pub async fn stop(&self, name: &str) -> Result<Vec<ProcessHandle>> {
        let _ops = self.ops.lock().await;
        self.stop_locked(name).await?;
        self.status(Some(name)).await
    }

    /// Restart an application and reset its restart counters.
    ///
    /// Running instances are cycled in place; otherwise the application is
    /// stopped (if partially alive) and started again.
    pub async fn restart(&self, name: &str) -> Result<Vec<ProcessHandle>> {
        let _ops = self.ops.lock().await;

        let controls = {
            let state = self.state.read().await;
            let entry = state.entry(name)?;
            let all_live =
                !entry.instances.is_empty() && entry.instances.iter().all(InstanceSlot::is_live);
            all_live.then(|| entry.live_controls())
        };

        match controls {
            Some(controls) => {
                info!(app = %name, "Restarting application");
                let mut acks = Vec::with_capacity(controls.len());
                for control in controls {
                    let (done, ack) = oneshot::channel();
                    if control.send(Control::Restart { done }).await.is_ok() {
                        acks.push(ack);
                    }
                }
                for ack in acks {
                    let _ = ack.await;
                }
            }
            None => {
                self.stop_locked(name).await?;
                self.start_locked(name).await?;
            }
        }

        self.status(Some(name)).await
    }

    /// Replace an application's spec: stop everything running under the old
    /// spec, then start under the new one, as one operation.
    pub async fn reload(&self, spec: ApplicationSpec) -> Result<Vec<ProcessHandle>> {
        let _ops = self.ops.lock().await;
        let name = spec.name.clone();

        let registered = self.state.read().await.apps.contains_key(&name);
        if registered {
            self.stop_locked(&name).await?;
        }

        {
            let mut state = self.state.write().await;
            match state.apps.get_mut(&name) {
                Some(entry) => entry.spec = Arc::new(spec),
                None => {
                    state.apps.insert(name.clone(), AppEntry::new(spec, None));
                }
            }
        }

        info!(app = %name, "Reloading application");
        self.start_locked(&name).await?;
        self.status(Some(&name)).await
    }

    /// Stop an application and forget it
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.stop_locked(name).await?;
        self.state.write().await.apps.remove(name);
        info!(app = %name, "Deleted application");
        Ok(())
    }

    /// Snapshots of one application's instances, or of all applications
    pub async fn status(&self, name: Option<&str>) -> Result<Vec<ProcessHandle>> {
        let state = self.state.read().await;
        match name {
            Some(name) => Ok(state.entry(name)?.handles()),
            None => Ok(state.apps.values().flat_map(AppEntry::handles).collect()),
        }
    }

    /// Current spec and source descriptor of an application
    pub async fn spec(&self, name: &str) -> Result<(Arc<ApplicationSpec>, Option<PathBuf>)> {
        let state = self.state.read().await;
        let entry = state.entry(name)?;
        Ok((entry.spec.clone(), entry.source.clone()))
    }

    /// Every registered application with whether it currently runs
    pub async fn summaries(&self) -> Vec<AppSummary> {
        let state = self.state.read().await;
        state
            .apps
            .values()
            .map(|entry| AppSummary {
                spec: entry.spec.clone(),
                source: entry.source.clone(),
                running: entry.is_live(),
            })
            .collect()
    }

    /// Stop all applications and the resource monitor
    pub async fn shutdown(&self) {
        let _ops = self.ops.lock().await;
        let names: Vec<String> = self.state.read().await.apps.keys().cloned().collect();

        for name in names {
            if let Err(e) = self.stop_locked(&name).await {
                warn!(app = %name, error = %e, "Failed to stop application during shutdown");
            }
        }

        self.monitor.abort();
        info!("Supervisor shut down");
    }

    async fn start_locked(&self, name: &str) -> Result<()> {
        let spec = {
            let state = self.state.read().await;
            let entry = state.entry(name)?;
            if entry.is_live() {
                return Ok(());
            }
            entry.spec.clone()
        };

        // Sinks of a run that ended on its own are still open
        self.release(name).await;

        let logs = Arc::new(LogRouter::open(&spec, &self.config).await?);
        let watcher = if spec.watch {
            match AppWatcher::start(&spec, self.state.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(app = %name, error = %e, "Watch disabled");
                    None
                }
            }
        } else {
            None
        };

        info!(app = %name, instances = spec.instances, mode = %spec.exec_mode, "Starting application");

        let mut reports = Vec::with_capacity(spec.instances);
        {
            let mut state = self.state.write().await;
            let ids: Vec<InstanceId> = (0..spec.instances).map(|_| state.allocate_id()).collect();

            let mut slots = Vec::with_capacity(ids.len());
            for (index, id) in ids.into_iter().enumerate() {
                let (control, receiver) = mpsc::channel(CONTROL_QUEUE);
                let (report, report_rx) = oneshot::channel();

                let mut handle = ProcessHandle::new(id, name, index);
                handle.state = LifecycleState::Starting;

                let controller = InstanceController::new(
                    id,
                    index,
                    spec.clone(),
                    logs.clone(),
                    self.state.clone(),
                    receiver,
                    report,
                );
                let task = tokio::spawn(controller.run());

                slots.push(InstanceSlot {
                    handle,
                    control,
                    task: Some(task),
                });
                reports.push(report_rx);
            }

            let entry = state.entry_mut(name)?;
            entry.instances = slots;
            entry.logs = Some(logs);
            entry.watcher = watcher;
        }

        let mut failure = None;
        for report in reports {
            if let Ok(Ok(Err(e))) = tokio::time::timeout(LAUNCH_REPORT_TIMEOUT, report).await {
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop_locked(&self, name: &str) -> Result<()> {
        let (controls, tasks) = {
            let mut state = self.state.write().await;
            let entry = state.entry_mut(name)?;
            let mut controls = Vec::new();
            let mut tasks = Vec::new();
            for slot in &mut entry.instances {
                if let Some(task) = slot.task.take() {
                    if !task.is_finished() {
                        controls.push(slot.control.clone());
                    }
                    tasks.push(task);
                }
            }
            (controls, tasks)
        };

        if !controls.is_empty() {
            info!(app = %name, instances = controls.len(), "Stopping application");
        }

        let mut acks = Vec::with_capacity(controls.len());
        for control in controls {
            let (done, ack) = oneshot::channel();
            if control.send(Control::Stop { done }).await.is_ok() {
                acks.push(ack);
            }
        }
        // A dropped ack means the controller already finished
        for ack in acks {
            let _ = ack.await;
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(app = %name, error = %e, "Instance controller failed");
            }
        }

        {
            let mut state = self.state.write().await;
            if let Ok(entry) = state.entry_mut(name) {
                for slot in &mut entry.instances {
                    if slot.handle.state.is_active() {
                        slot.handle.state = LifecycleState::Stopped;
                        slot.handle.pid = None;
                    }
                }
            }
        }

        self.release(name).await;
        Ok(())
    }

    /// Close the log sinks and watcher of an application with no live instances
    async fn release(&self, name: &str) {
        let (logs, watcher) = {
            let mut state = self.state.write().await;
            match state.apps.get_mut(name) {
                Some(entry) => (entry.logs.take(), entry.watcher.take()),
                None => (None, None),
            }
        };

        drop(watcher);
        if let Some(logs) = logs {
            logs.close().await;
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}
