// Daemon module - Background process management

pub mod daemonize;
pub mod manager;
pub mod pid;
pub mod service;

pub use daemonize::daemonize;
pub use manager::{DaemonManager, DaemonStatus};
pub use pid::PidFile;
pub use service::Daemon;
