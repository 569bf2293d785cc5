// Logs module - Output routing, rotation and tailing

mod reader;
mod router;
mod writer;

pub use reader::{read_app_logs, read_last_lines, LogEntry, LogSelection, DEFAULT_LOG_LINES};
pub use router::LogRouter;
pub use writer::{timestamp_line, LogSink, DEFAULT_MAX_LOG_SIZE};
