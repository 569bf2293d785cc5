use crate::config::ApplicationSpec;
use crate::error::ShepherdError;
use crate::logs::LogRouter;
use crate::process::restart::{RestartDecision, RestartPolicy, RestartTracker};
use crate::process::spawner::{launch, terminate_gracefully, SpawnedProcess};
use crate::process::supervisor::SupervisorState;
use crate::process::types::{InstanceId, LifecycleState, ProcessHandle};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot, RwLock};

/// Queue depth of an instance's control channel
pub(crate) const CONTROL_QUEUE: usize = 16;

/// Messages delivered to an instance controller
#[derive(Debug)]
pub(crate) enum Control {
    /// Stop for good; acknowledged once the process is gone
    Stop { done: oneshot::Sender<()> },
    /// Manual restart; resets the restart count, acknowledged once relaunched
    Restart { done: oneshot::Sender<()> },
    /// Sent by the resource monitor for the process with this pid
    MemoryExceeded { pid: u32, rss: u64, limit: u64 },
    /// Debounced change under a watched directory
    FilesChanged,
}

/// How a supervised run of one process ended
enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    MemoryExceeded { rss: u64, limit: u64 },
    Stop(oneshot::Sender<()>),
    Restart(oneshot::Sender<()>),
    FilesChanged,
    Detached,
}

/// Result of the first launch attempt, reported back to `start()`
pub(crate) type LaunchReport = std::result::Result<u32, ShepherdError>;

/// Drives the lifecycle of one instance.
///
/// Every transition of the instance happens on this task, in order. The
/// supervisor and the resource monitor talk to it only via `Control`
/// messages, so a crash and a manual stop can never race.
pub(crate) struct InstanceController {
    id: InstanceId,
    index: usize,
    spec: Arc<ApplicationSpec>,
    logs: Arc<LogRouter>,
    state: Arc<RwLock<SupervisorState>>,
    control: mpsc::Receiver<Control>,
    policy: RestartPolicy,
    tracker: RestartTracker,
    first_launch: Option<oneshot::Sender<LaunchReport>>,
    pending_ack: Option<oneshot::Sender<()>>,
}

impl InstanceController {
    pub(crate) fn new(
        id: InstanceId,
        index: usize,
        spec: Arc<ApplicationSpec>,
        logs: Arc<LogRouter>,
        state: Arc<RwLock<SupervisorState>>,
        control: mpsc::Receiver<Control>,
        first_launch: oneshot::Sender<LaunchReport>,
    ) -> Self {
        Self {
            id,
            index,
            policy: RestartPolicy::from_spec(&spec),
            spec,
            logs,
            state,
            control,
            tracker: RestartTracker::new(),
            first_launch: Some(first_launch),
            pending_ack: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.publish(|h| {
                h.state = LifecycleState::Starting;
                h.pid = None;
                h.memory = 0;
            })
            .await;

            let mut process = match launch(&self.spec, self.index) {
                Ok(process) => process,
                Err(e) => {
                    tracing::error!(
                        app = %self.spec.name,
                        instance = self.index,
                        error = %e,
                        "Launch failed"
                    );
                    let reason = e.to_string();
                    self.report_launch(Err(e));
                    if self.after_crash(Duration::ZERO, reason).await {
                        continue;
                    }
                    return;
                }
            };

            if let Err(e) = self.logs.attach(&mut process.child) {
                tracing::warn!(app = %self.spec.name, error = %e, "Output not routed");
            }

            let pid = process.pid;
            self.publish(|h| {
                h.state = LifecycleState::Running;
                h.pid = Some(pid);
                h.started_at = Some(SystemTime::now());
            })
            .await;
            self.report_launch(Ok(pid));
            if let Some(done) = self.pending_ack.take() {
                let _ = done.send(());
            }

            tracing::info!(app = %self.spec.name, instance = self.index, pid, "Process running");

            let started = Instant::now();
            match self.supervise(&mut process).await {
                Outcome::Exited(Ok(status))
                    if status
                        .code()
                        .is_some_and(|code| self.spec.stop_exit_codes.contains(&code)) =>
                {
                    tracing::info!(app = %self.spec.name, instance = self.index, pid, %status, "Process finished");
                    self.publish(|h| {
                        h.state = LifecycleState::Stopped;
                        h.pid = None;
                    })
                    .await;
                    return;
                }
                Outcome::Exited(result) => {
                    let reason = match result {
                        Ok(status) => format!("process {}", status),
                        Err(e) => format!("failed to wait for process: {}", e),
                    };
                    tracing::warn!(app = %self.spec.name, instance = self.index, pid, reason = %reason, "Process crashed");
                    if !self.after_crash(started.elapsed(), reason).await {
                        return;
                    }
                }
                Outcome::MemoryExceeded { rss, limit } => {
                    let reason = ShepherdError::MemoryLimitExceeded {
                        app: self.spec.name.clone(),
                        instance: self.index,
                        rss,
                        limit,
                    }
                    .to_string();
                    if !self.after_crash(started.elapsed(), reason).await {
                        return;
                    }
                }
                Outcome::Stop(done) => {
                    self.publish(|h| {
                        h.state = LifecycleState::Stopped;
                        h.pid = None;
                    })
                    .await;
                    tracing::info!(app = %self.spec.name, instance = self.index, "Process stopped");
                    let _ = done.send(());
                    return;
                }
                Outcome::Restart(done) => {
                    self.tracker.clear();
                    self.publish(|h| h.restarts = 0).await;
                    self.pending_ack = Some(done);
                }
                Outcome::FilesChanged => {
                    tracing::info!(app = %self.spec.name, instance = self.index, "Restarting after file change");
                    self.publish(|h| h.restarts += 1).await;
                }
                Outcome::Detached => {
                    self.publish(|h| {
                        h.state = LifecycleState::Stopped;
                        h.pid = None;
                    })
                    .await;
                    return;
                }
            }
        }
    }

    /// Wait for the process to exit or for a control message that ends this run
    async fn supervise(&mut self, process: &mut SpawnedProcess) -> Outcome {
        loop {
            tokio::select! {
                status = process.child.wait() => return Outcome::Exited(status),
                message = self.control.recv() => match message {
                    None => {
                        self.terminate(process).await;
                        return Outcome::Detached;
                    }
                    Some(Control::Stop { done }) => {
                        self.terminate(process).await;
                        return Outcome::Stop(done);
                    }
                    Some(Control::Restart { done }) => {
                        self.terminate(process).await;
                        return Outcome::Restart(done);
                    }
                    Some(Control::MemoryExceeded { pid, rss, limit }) if pid == process.pid => {
                        self.terminate(process).await;
                        return Outcome::MemoryExceeded { rss, limit };
                    }
                    Some(Control::FilesChanged) if self.spec.watch => {
                        self.terminate(process).await;
                        return Outcome::FilesChanged;
                    }
                    // Stale breach for an earlier pid, or watch disabled
                    Some(_) => {}
                },
            }
        }
    }

    async fn terminate(&self, process: &mut SpawnedProcess) {
        self.publish(|h| h.state = LifecycleState::Stopping).await;

        if let Err(e) = terminate_gracefully(
            &mut process.child,
            &self.spec.kill_signal,
            self.spec.kill_timeout,
        )
        .await
        {
            tracing::error!(app = %self.spec.name, pid = process.pid, error = %e, "Failed to terminate process");
        }
    }

    /// Record a crash and apply the restart policy.
    ///
    /// Returns true when the controller should launch again.
    async fn after_crash(&mut self, uptime: Duration, reason: String) -> bool {
        self.publish(|h| {
            h.state = LifecycleState::Crashed;
            h.pid = None;
            h.memory = 0;
            h.last_error = Some(reason);
        })
        .await;

        // A crash while restarting still completes the restart request
        if let Some(done) = self.pending_ack.take() {
            let _ = done.send(());
        }

        let delay = match self.tracker.on_crash(&self.policy, uptime) {
            RestartDecision::Restart(delay) => delay,
            RestartDecision::Disabled => {
                self.publish(|h| h.state = LifecycleState::Stopped).await;
                return false;
            }
            RestartDecision::GiveUp => {
                let error = ShepherdError::RestartLimitExceeded(self.spec.name.clone());
                tracing::error!(
                    app = %self.spec.name,
                    instance = self.index,
                    restarts = self.tracker.streak(),
                    "{}",
                    error
                );
                self.publish(|h| {
                    h.state = LifecycleState::Stopped;
                    h.last_error = Some(error.to_string());
                })
                .await;
                return false;
            }
        };

        tracing::info!(
            app = %self.spec.name,
            instance = self.index,
            delay_ms = delay.as_millis() as u64,
            "Scheduling restart"
        );

        // Explicit commands cancel the backoff timer immediately
        let backoff = tokio::time::sleep(delay);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                message = self.control.recv() => match message {
                    None => {
                        self.publish(|h| h.state = LifecycleState::Stopped).await;
                        return false;
                    }
                    Some(Control::Stop { done }) => {
                        self.publish(|h| h.state = LifecycleState::Stopped).await;
                        let _ = done.send(());
                        return false;
                    }
                    Some(Control::Restart { done }) => {
                        self.tracker.clear();
                        self.publish(|h| h.restarts = 0).await;
                        self.pending_ack = Some(done);
                        return true;
                    }
                    Some(_) => {}
                },
            }
        }

        self.publish(|h| h.restarts += 1).await;
        true
    }

    fn report_launch(&mut self, report: LaunchReport) {
        if let Some(sender) = self.first_launch.take() {
            let _ = sender.send(report);
        }
    }

    /// Apply a change to this instance's handle under the supervisor lock
    async fn publish<F>(&self, change: F)
    where
        F: FnOnce(&mut ProcessHandle),
    {
        let mut state = self.state.write().await;
        if let Some(handle) = state.handle_mut(self.id) {
            change(handle);
        }
    }
}
