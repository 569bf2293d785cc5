use crate::config::{ApplicationSpec, SupervisorConfig};
use crate::error::{Result, ShepherdError};
use crate::logs::writer::{timestamp_line, LogSink};
use chrono::Local;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Longest chunk buffered from a pipe; longer lines are split
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct LogLine {
    stream: Stream,
    data: Vec<u8>,
}

/// Routes the output of every instance of one application into its three
/// sinks.
///
/// Pipe readers push lines into a bounded queue and never wait on disk: when
/// the queue is full the line is dropped and counted. A single writer task
/// owns the sinks, so lines from one pipe keep their order.
pub struct LogRouter {
    app: String,
    sender: Mutex<Option<mpsc::Sender<LogLine>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
    close_timeout: Duration,
}

impl LogRouter {
    /// Open the application's sinks and start the writer task.
    ///
    /// Fails with `LogSink` if any of the three files cannot be opened.
    pub async fn open(spec: &ApplicationSpec, config: &SupervisorConfig) -> Result<Self> {
        let out = LogSink::open(&spec.logs.out, config.max_log_size).await?;
        let err = LogSink::open(&spec.logs.err, config.max_log_size).await?;
        let combined = LogSink::open(&spec.logs.combined, config.max_log_size).await?;

        let (sender, receiver) = mpsc::channel(config.log_queue.max(1));
        let writer = tokio::spawn(write_task(receiver, out, err, combined, spec.time));

        Ok(Self {
            app: spec.name.clone(),
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            readers: Mutex::new(Vec::new()),
            dropped: Arc::new(AtomicU64::new(0)),
            close_timeout: config.log_close_timeout,
        })
    }

    /// Take the child's stdout and stderr pipes and forward their lines
    pub fn attach(&self, child: &mut Child) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| {
                ShepherdError::Other(format!("Log router for '{}' is closed", self.app))
            })?;

        let mut handles = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            handles.push(tokio::spawn(read_pipe(
                stdout,
                Stream::Stdout,
                sender.clone(),
                self.dropped.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            handles.push(tokio::spawn(read_pipe(
                stderr,
                Stream::Stderr,
                sender.clone(),
                self.dropped.clone(),
            )));
        }

        if let Ok(mut readers) = self.readers.lock() {
            readers.retain(|h| !h.is_finished());
            readers.extend(handles);
        }

        Ok(())
    }

    /// Lines dropped because the queue was full
    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting output and wait (bounded) for queued lines to reach disk
    pub async fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        let writer = self.writer.lock().ok().and_then(|mut guard| guard.take());
        let Some(mut writer) = writer else {
            return;
        };

        if tokio::time::timeout(self.close_timeout, &mut writer).await.is_err() {
            // Pipes still held open (e.g. by a grandchild); cut them loose
            self.abort_readers();
            if tokio::time::timeout(self.close_timeout, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }

        let dropped = self.dropped_lines();
        if dropped > 0 {
            tracing::warn!(app = %self.app, dropped, "Log lines dropped under backpressure");
        }
    }

    fn abort_readers(&self) {
        if let Ok(mut readers) = self.readers.lock() {
            for handle in readers.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for LogRouter {
    fn drop(&mut self) {
        self.abort_readers();
        if let Some(writer) = self.writer.get_mut().ok().and_then(Option::take) {
            writer.abort();
        }
    }
}

async fn read_pipe<R>(
    pipe: R,
    stream: Stream,
    sender: mpsc::Sender<LogLine>,
    dropped: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);

    loop {
        let mut data = Vec::new();
        let mut chunk = (&mut reader).take(MAX_LINE_BYTES as u64);
        match chunk.read_until(b'\n', &mut data).await {
            Ok(0) | Err(_) => break,
            Ok(_) => match sender.try_send(LogLine { stream, data }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            },
        }
    }
}

async fn write_task(
    mut receiver: mpsc::Receiver<LogLine>,
    mut out: LogSink,
    mut err: LogSink,
    mut combined: LogSink,
    time: bool,
) {
    while let Some(first) = receiver.recv().await {
        let mut next = Some(first);
        // Drain whatever is queued before flushing
        while let Some(line) = next {
            match line.stream {
                Stream::Stdout => out.write_line(&line.data).await,
                Stream::Stderr => err.write_line(&line.data).await,
            }
            if time {
                combined
                    .write_line(&timestamp_line(&Local::now(), &line.data))
                    .await;
            } else {
                combined.write_line(&line.data).await;
            }
            next = receiver.try_recv().ok();
        }

        out.flush().await;
        err.flush().await;
        combined.flush().await;
    }

    out.flush().await;
    err.flush().await;
    combined.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppDescriptor, ArgList};
    use std::process::Stdio;
    use tempfile::TempDir;
    use tokio::process::Command;

    fn spec_in(dir: &std::path::Path, time: bool) -> ApplicationSpec {
        std::fs::write(dir.join("app.sh"), "").unwrap();
        AppDescriptor {
            name: Some("echoer".into()),
            script: Some("app.sh".into()),
            args: Some(ArgList::List(vec![])),
            time: Some(time),
            ..Default::default()
        }
        .resolve(dir, &dir.join("logs"))
        .unwrap()
    }

    async fn run_through_router(router: &LogRouter, script: &str) {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        router.attach(&mut child).unwrap();
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_routes_streams_to_sinks() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec_in(temp_dir.path(), false);

        let router = LogRouter::open(&spec, &SupervisorConfig::default())
            .await
            .unwrap();
        run_through_router(&router, "echo out-line; echo err-line >&2").await;
        router.close().await;

        let out = std::fs::read_to_string(&spec.logs.out).unwrap();
        let err = std::fs::read_to_string(&spec.logs.err).unwrap();
        let combined = std::fs::read_to_string(&spec.logs.combined).unwrap();

        assert_eq!(out, "out-line\n");
        assert_eq!(err, "err-line\n");
        assert!(combined.contains("out-line\n"));
        assert!(combined.contains("err-line\n"));
        assert!(!combined.starts_with('['));
    }

    #[tokio::test]
    async fn test_timestamps_only_in_combined() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec_in(temp_dir.path(), true);

        let router = LogRouter::open(&spec, &SupervisorConfig::default())
            .await
            .unwrap();
        run_through_router(&router, "echo one; echo two").await;
        router.close().await;

        let out = std::fs::read_to_string(&spec.logs.out).unwrap();
        assert_eq!(out, "one\ntwo\n");

        let combined = std::fs::read_to_string(&spec.logs.combined).unwrap();
        let lines: Vec<&str> = combined.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] one"));
        assert!(lines[1].ends_with("] two"));
    }

    #[tokio::test]
    async fn test_preserves_line_order() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec_in(temp_dir.path(), false);

        let router = LogRouter::open(&spec, &SupervisorConfig::default())
            .await
            .unwrap();
        run_through_router(&router, "for i in 1 2 3 4 5 6 7 8 9 10; do echo $i; done").await;
        router.close().await;

        let out = std::fs::read_to_string(&spec.logs.out).unwrap();
        let expected: String = (1..=10).map(|i| format!("{}\n", i)).collect();
        assert_eq!(out, expected);
        assert_eq!(router.dropped_lines(), 0);
    }

    #[tokio::test]
    async fn test_long_line_without_newline_is_split() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec_in(temp_dir.path(), false);

        let router = LogRouter::open(&spec, &SupervisorConfig::default())
            .await
            .unwrap();
        // 200 KiB of 'x' and no trailing newline
        run_through_router(&router, "head -c 204800 /dev/zero | tr '\\0' x").await;
        router.close().await;

        let out = std::fs::read_to_string(&spec.logs.out).unwrap();
        let chunks: Vec<&str> = out.lines().collect();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= MAX_LINE_BYTES));
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 204800);
        assert!(out.bytes().all(|b| b == b'x' || b == b'\n'));
    }

    #[tokio::test]
    async fn test_unopenable_sink_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut spec = spec_in(temp_dir.path(), false);
        // A directory cannot be opened as a log file
        spec.logs.err = temp_dir.path().to_path_buf();

        let result = LogRouter::open(&spec, &SupervisorConfig::default()).await;
        assert!(matches!(result, Err(ShepherdError::LogSink { .. })));
    }

    #[tokio::test]
    async fn test_attach_after_close_fails() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec_in(temp_dir.path(), false);
        let router = LogRouter::open(&spec, &SupervisorConfig::default())
            .await
            .unwrap();
        router.close().await;

        let mut child = Command::new("true").spawn().unwrap();
        assert!(router.attach(&mut child).is_err());
        child.wait().await.unwrap();
    }
}
