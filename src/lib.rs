// Shepherd: supervises long-running applications described by descriptor files

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod logs;
pub mod process;
pub mod state;
