use crate::error::{Result, ShepherdError};
use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;

/// Default maximum log file size before rotation (10MB)
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// One append-only log file with size-based rotation.
///
/// After the first write failure the sink goes quiet: the failure is
/// logged once and later lines are dropped so the supervised process is
/// never blocked by a broken disk.
pub struct LogSink {
    path: PathBuf,
    file: TokioFile,
    max_size: u64,
    size: u64,
    failed: bool,
}

impl LogSink {
    /// Open (or create) a sink in append mode, creating parent directories
    pub async fn open(path: &Path, max_size: u64) -> Result<Self> {
        let sink_error = |reason: String| ShepherdError::LogSink {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| sink_error(format!("failed to create directory: {}", e)))?;
        }

        let file = Self::open_append(path).map_err(|e| sink_error(e.to_string()))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            file: TokioFile::from_std(file),
            max_size,
            size,
            failed: false,
        })
    }

    fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Append one line, adding the trailing newline if missing
    pub async fn write_line(&mut self, line: &[u8]) {
        if self.failed {
            return;
        }

        if let Err(e) = self.try_write_line(line).await {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Log sink failed, dropping further output"
            );
            self.failed = true;
        }
    }

    async fn try_write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        if self.max_size > 0 && self.size >= self.max_size {
            self.rotate().await?;
        }

        self.file.write_all(line).await?;
        let mut written = line.len() as u64;
        if !line.ends_with(b"\n") {
            self.file.write_all(b"\n").await?;
            written += 1;
        }
        self.size += written;
        Ok(())
    }

    /// Rename the current file with a timestamp suffix and start a new one
    async fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;

        let timestamp = Local::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("log");
        let mut rotated = self.path.with_file_name(format!("{}-{}.log", stem, timestamp));
        let mut suffix = 1;
        while tokio::fs::try_exists(&rotated).await? {
            rotated = self
                .path
                .with_file_name(format!("{}-{}-{}.log", stem, timestamp, suffix));
            suffix += 1;
        }

        tokio::fs::rename(&self.path, &rotated).await?;
        self.file = TokioFile::from_std(Self::open_append(&self.path)?);
        self.size = 0;

        tracing::debug!(path = %self.path.display(), rotated = %rotated.display(), "Rotated log file");
        Ok(())
    }

    pub async fn flush(&mut self) {
        if !self.failed {
            let _ = self.file.flush().await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }
}

/// Prefix a line with `[YYYY-MM-DD HH:MM:SS.mmm] `
pub fn timestamp_line(timestamp: &DateTime<Local>, line: &[u8]) -> Vec<u8> {
    let stamp = timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    let mut entry = Vec::with_capacity(stamp.len() + 3 + line.len());
    entry.push(b'[');
    entry.extend_from_slice(stamp.as_bytes());
    entry.extend_from_slice(b"] ");
    entry.extend_from_slice(line);
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/app-out.log");

        let sink = LogSink::open(&path, DEFAULT_MAX_LOG_SIZE).await.unwrap();
        assert!(path.exists());
        assert_eq!(sink.size(), 0);
        assert!(!sink.has_failed());
    }

    #[tokio::test]
    async fn test_write_appends_newline() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app-out.log");

        let mut sink = LogSink::open(&path, DEFAULT_MAX_LOG_SIZE).await.unwrap();
        sink.write_line(b"first").await;
        sink.write_line(b"second\n").await;
        sink.flush().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "first\nsecond\n");
        assert_eq!(sink.size(), 13);
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app-out.log");
        std::fs::write(&path, "old\n").unwrap();

        let mut sink = LogSink::open(&path, DEFAULT_MAX_LOG_SIZE).await.unwrap();
        assert_eq!(sink.size(), 4);
        sink.write_line(b"new").await;
        sink.flush().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "old\nnew\n");
    }

    #[tokio::test]
    async fn test_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app-out.log");

        let mut sink = LogSink::open(&path, 64).await.unwrap();
        for _ in 0..10 {
            sink.write_line(b"This is a test log entry").await;
        }
        sink.flush().await;

        let rotated = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("app-out-") && name.ends_with(".log")
            })
            .count();
        assert!(rotated >= 1, "expected a rotated file");
        assert!(sink.size() < 64 + 26);
    }

    #[tokio::test]
    async fn test_rapid_rotations_keep_every_line() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app-out.log");

        // Every write after the first rotates, many within one millisecond
        let mut sink = LogSink::open(&path, 1).await.unwrap();
        for i in 0..20 {
            sink.write_line(format!("line {}", i).as_bytes()).await;
        }
        sink.flush().await;
        assert!(!sink.has_failed());

        let mut lines: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .flat_map(|e| {
                std::fs::read_to_string(e.path())
                    .unwrap()
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        lines.sort();
        let mut expected: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
        expected.sort();
        assert_eq!(lines, expected);
    }

    #[test]
    fn test_timestamp_line_format() {
        let ts = Local::now();
        let line = timestamp_line(&ts, b"hello");
        let text = String::from_utf8(line).unwrap();
        assert!(text.starts_with('['));
        assert!(text.ends_with("] hello"));
        // [YYYY-MM-DD HH:MM:SS.mmm]
        assert_eq!(text.find(']'), Some(24));
    }
}
