use crate::config::LogPaths;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Number of lines shown when none is requested
pub const DEFAULT_LOG_LINES: usize = 50;

/// Which sink the `logs` command reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSelection {
    Out,
    Err,
    #[default]
    Combined,
}

impl LogSelection {
    pub fn path<'a>(&self, logs: &'a LogPaths) -> &'a Path {
        match self {
            LogSelection::Out => &logs.out,
            LogSelection::Err => &logs.err,
            LogSelection::Combined => &logs.combined,
        }
    }
}

/// A log line split into its optional timestamp and message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: Option<String>,
    pub message: String,
}

impl LogEntry {
    /// Split a `[YYYY-MM-DD HH:MM:SS.mmm] message` line; other lines are kept whole
    pub fn parse(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                let stamp = &rest[..end];
                if looks_like_timestamp(stamp) {
                    return Self {
                        timestamp: Some(stamp.to_string()),
                        message: rest[end + 1..].trim_start().to_string(),
                    };
                }
            }
        }

        Self {
            timestamp: None,
            message: line.to_string(),
        }
    }
}

fn looks_like_timestamp(s: &str) -> bool {
    s.len() == 23 && s.as_bytes()[4] == b'-' && s.as_bytes()[10] == b' '
}

/// Read the last `lines` lines of a log file; a missing file reads as empty
pub async fn read_last_lines(path: &Path, lines: usize) -> Result<Vec<String>> {
    if lines == 0 || !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    // Grows with the file, not with the requested count
    let mut tail = VecDeque::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        let line = String::from_utf8_lossy(&buf);
        tail.push_back(line.trim_end_matches(['\n', '\r']).to_string());
    }

    Ok(tail.into_iter().collect())
}

/// Read the last lines of one of an application's sinks
pub async fn read_app_logs(
    logs: &LogPaths,
    selection: LogSelection,
    lines: usize,
) -> Result<Vec<String>> {
    read_last_lines(selection.path(logs), lines).await
}
