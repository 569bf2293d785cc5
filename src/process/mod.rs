// Process module - Launching, supervision and restart policy

mod controller;
mod monitor;
pub mod restart;
pub mod spawner;
mod supervisor;
mod types;
mod watcher;

pub use monitor::{MemorySampler, SysinfoSampler};
pub use restart::{RestartDecision, RestartPolicy, RestartTracker};
pub use spawner::{launch, terminate_gracefully, SpawnedProcess};
pub use supervisor::{AppSummary, Supervisor};
pub use types::{InstanceId, LifecycleState, ProcessHandle};
pub use watcher::{AppWatcher, WATCH_DEBOUNCE};
