use crate::process::controller::Control;
use crate::process::supervisor::SupervisorState;
use crate::process::types::InstanceId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::{mpsc, RwLock};

/// Source of resident memory readings.
///
/// Sampling may block, so the monitor always calls it off the async
/// executor and never while holding the supervisor lock.
pub trait MemorySampler: Send + 'static {
    /// Resident memory in bytes for each pid still alive
    fn sample(&mut self, pids: &[u32]) -> HashMap<u32, u64>;
}

/// `MemorySampler` backed by sysinfo
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&mut self, pids: &[u32]) -> HashMap<u32, u64> {
        let sys_pids: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&sys_pids),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        sys_pids
            .iter()
            .filter_map(|pid| {
                self.system
                    .process(*pid)
                    .map(|process| (pid.as_u32(), process.memory()))
            })
            .collect()
    }
}

/// A running instance as seen by one monitor pass
#[derive(Debug, Clone)]
pub(crate) struct MemoryTarget {
    pub app: String,
    pub instance: usize,
    pub id: InstanceId,
    pub pid: u32,
    pub limit: Option<u64>,
    pub control: mpsc::Sender<Control>,
}

/// Poll memory of every running instance until the task is aborted
pub(crate) async fn run_monitor(
    state: Arc<RwLock<SupervisorState>>,
    mut sampler: Box<dyn MemorySampler>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        // Snapshot under the lock, then release before touching the OS
        let targets = state.read().await.memory_targets();
        if targets.is_empty() {
            continue;
        }

        let pids: Vec<u32> = targets.iter().map(|t| t.pid).collect();
        let sampled = tokio::task::spawn_blocking(move || {
            let samples = sampler.sample(&pids);
            (sampler, samples)
        })
        .await;

        let samples = match sampled {
            Ok((returned, samples)) => {
                sampler = returned;
                samples
            }
            Err(e) => {
                tracing::error!(error = %e, "Memory sampler panicked, stopping resource monitor");
                return;
            }
        };

        {
            let mut state = state.write().await;
            for target in &targets {
                if let Some(rss) = samples.get(&target.pid) {
                    state.record_memory(target.id, target.pid, *rss);
                }
            }
        }

        for target in targets {
            let (Some(limit), Some(rss)) = (target.limit, samples.get(&target.pid).copied()) else {
                continue;
            };
            if rss <= limit {
                continue;
            }

            tracing::warn!(
                app = %target.app,
                instance = target.instance,
                pid = target.pid,
                rss,
                limit,
                "Memory limit exceeded"
            );

            // A full queue means the controller is already busy with this process
            let _ = target.control.try_send(Control::MemoryExceeded {
                pid: target.pid,
                rss,
                limit,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_samples_own_process() {
        let mut sampler = SysinfoSampler::new();
        let own = std::process::id();

        let samples = sampler.sample(&[own]);
        assert!(samples.get(&own).copied().unwrap_or(0) > 0);
    }

    #[test]
    fn test_sysinfo_skips_dead_pids() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let mut sampler = SysinfoSampler::new();
        let samples = sampler.sample(&[pid]);
        assert!(!samples.contains_key(&pid));
    }
}
