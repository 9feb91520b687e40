//! Run logger with four message classes
//!
//! Producers hand lines to bounded queues (stdout, stderr, command, file) and
//! a dedicated consumer task per queue forwards them to `tracing`. Producers
//! await when a queue is full, so a slow sink throttles the run instead of
//! dropping lines.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

/// Default capacity of each message queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// A file published on the file message class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Where the file lives on disk
    pub path: PathBuf,
    /// Its content at publication time
    pub content: String,
}

/// Cloneable producer side of the run logger
#[derive(Debug, Clone)]
pub struct Logger {
    run_id: Arc<str>,
    stdout: mpsc::Sender<String>,
    stderr: mpsc::Sender<String>,
    cmd: mpsc::Sender<String>,
    file: mpsc::Sender<FileEntry>,
}

/// Consumer side of the four queues
#[derive(Debug)]
pub struct LogReceivers {
    /// Progress and remote stdout lines
    pub stdout: mpsc::Receiver<String>,
    /// Error and remote stderr lines
    pub stderr: mpsc::Receiver<String>,
    /// Commands about to run
    pub cmd: mpsc::Receiver<String>,
    /// Published files
    pub file: mpsc::Receiver<FileEntry>,
}

/// Handles of the running consumer tasks
#[derive(Debug)]
pub struct LogWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl Logger {
    /// Create a logger and the receivers of its queues
    pub fn channels(run_id: impl Into<String>, capacity: usize) -> (Logger, LogReceivers) {
        let (stdout_tx, stdout_rx) = mpsc::channel(capacity);
        let (stderr_tx, stderr_rx) = mpsc::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (file_tx, file_rx) = mpsc::channel(capacity);
        let logger = Logger {
            run_id: Arc::from(run_id.into()),
            stdout: stdout_tx,
            stderr: stderr_tx,
            cmd: cmd_tx,
            file: file_tx,
        };
        let receivers = LogReceivers {
            stdout: stdout_rx,
            stderr: stderr_rx,
            cmd: cmd_rx,
            file: file_rx,
        };
        (logger, receivers)
    }

    /// Identifier of the run this logger belongs to
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Log a progress line
    pub async fn log(&self, msg: impl Into<String>) {
        let msg = msg.into();
        if let Err(e) = self.stdout.send(msg).await {
            trace!(line = %e.0, "stdout queue closed");
        }
    }

    /// Log an error line
    pub async fn log_err(&self, msg: impl Into<String>) {
        let msg = msg.into();
        if let Err(e) = self.stderr.send(msg).await {
            warn!(line = %e.0, "stderr queue closed");
        }
    }

    /// Log a command before it runs
    pub async fn log_cmd(&self, cmd: impl Into<String>) {
        let cmd = cmd.into();
        if let Err(e) = self.cmd.send(cmd).await {
            trace!(command = %e.0, "command queue closed");
        }
    }

    /// Publish a file and its content
    pub async fn log_file(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        let entry = FileEntry {
            path: path.into(),
            content: content.into(),
        };
        if let Err(e) = self.file.send(entry).await {
            trace!(path = %e.0.path.display(), "file queue closed");
        }
    }
}

impl LogReceivers {
    /// Spawn one consumer task per queue.
    ///
    /// Stdout lines are emitted at `info` only when `verbose` is set.
    pub fn spawn(self, verbose: bool) -> LogWorkers {
        let LogReceivers {
            mut stdout,
            mut stderr,
            mut cmd,
            mut file,
        } = self;

        let handles = vec![
            tokio::spawn(async move {
                while let Some(line) = stdout.recv().await {
                    if verbose {
                        info!("{}", line);
                    } else {
                        trace!("{}", line);
                    }
                }
            }),
            tokio::spawn(async move {
                while let Some(line) = stderr.recv().await {
                    warn!("{}", line);
                }
            }),
            tokio::spawn(async move {
                while let Some(line) = cmd.recv().await {
                    info!(command = %line, "running");
                }
            }),
            tokio::spawn(async move {
                while let Some(entry) = file.recv().await {
                    info!("{}", file_block(&entry));
                }
            }),
        ];
        LogWorkers { handles }
    }
}

impl LogWorkers {
    /// Wait for every consumer to drain its queue.
    ///
    /// Consumers finish once every [`Logger`] clone has been dropped.
    pub async fn shutdown(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "log consumer task failed");
            }
        }
    }
}

/// Render a published file as a delimited block
pub fn file_block(entry: &FileEntry) -> String {
    let rule = "=".repeat(60);
    format!(
        "{rule}\n{}\n{rule}\n{}\n{rule}",
        entry.path.display(),
        entry.content.trim_end()
    )
}
