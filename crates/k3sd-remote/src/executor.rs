//! Command and script execution over a [`RemoteSession`]

use tokio::sync::mpsc;
use tracing::debug;

use k3sd_common::{Error, Logger, NodeSpec, Result, DEFAULT_SSH_PORT};

use crate::session::RemoteSession;
use crate::ssh::split_host_port;

/// Capacity of the per-command stdout/stderr channels
const STREAM_CAPACITY: usize = 64;

/// Run `commands` sequentially, one channel each.
///
/// Each command is logged on the command class before it runs. Output is
/// streamed line by line into the logger, tagged with the host; the next
/// command starts only after both streams drained and the command exited.
/// The first non-zero exit aborts the sequence.
pub async fn execute_commands<S: AsRef<str>>(
    session: &dyn RemoteSession,
    commands: &[S],
    logger: &Logger,
) -> Result<()> {
    let host = session.host().to_string();
    for command in commands {
        let command = command.as_ref();
        logger.log_cmd(format!("[{}] {}", host, command)).await;

        let (out_tx, out_rx) = mpsc::channel(STREAM_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(STREAM_CAPACITY);
        let (status, ()) = tokio::join!(
            session.exec(command, out_tx, err_tx),
            merge_streams(&host, out_rx, err_rx, logger)
        );

        match status? {
            0 => debug!(host = %host, command = %command, "command succeeded"),
            code => {
                logger
                    .log_err(format!("[{}] command exited with status {}: {}", host, code, command))
                    .await;
                return Err(Error::command(&host, command, Some(code), "exited non-zero"));
            }
        }
    }
    Ok(())
}

/// Run `script` through `bash -c` and return its stdout.
///
/// Both streams are buffered in full. A non-zero exit yields
/// [`Error::Script`] carrying the captured stderr.
pub async fn execute_script(session: &dyn RemoteSession, script: &str) -> Result<String> {
    let command = format!("bash -c {}", shell_quote(script));

    let (out_tx, out_rx) = mpsc::channel(STREAM_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(STREAM_CAPACITY);
    let (status, stdout, stderr) = tokio::join!(
        session.exec(&command, out_tx, err_tx),
        collect(out_rx),
        collect(err_rx)
    );

    match status? {
        0 => Ok(stdout),
        code => Err(Error::script(session.host(), Some(code), stderr.trim_end())),
    }
}

/// Wrap `command` so the control-plane node runs it on `worker` over ssh
pub fn relay(worker: &NodeSpec, command: &str) -> String {
    let (host, port) = split_host_port(&worker.address)
        .unwrap_or_else(|_| (worker.address.clone(), DEFAULT_SSH_PORT));
    let port_flag = if port == DEFAULT_SSH_PORT {
        String::new()
    } else {
        format!("-p {} ", port)
    };
    format!(
        "ssh {}{}@{} {}",
        port_flag,
        worker.user,
        host,
        shell_quote(command)
    )
}

/// Single-quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Splits a byte stream into lines, holding back an incomplete tail
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// Return the incomplete tail, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Tag and forward both streams until each sender is gone
async fn merge_streams(
    host: &str,
    mut stdout: mpsc::Receiver<Vec<u8>>,
    mut stderr: mpsc::Receiver<Vec<u8>>,
    logger: &Logger,
) {
    let mut out_lines = LineBuffer::default();
    let mut err_lines = LineBuffer::default();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            chunk = stdout.recv(), if out_open => match chunk {
                Some(chunk) => {
                    for line in out_lines.push(&chunk) {
                        logger.log(format!("[{}] {}", host, line)).await;
                    }
                }
                None => out_open = false,
            },
            chunk = stderr.recv(), if err_open => match chunk {
                Some(chunk) => {
                    for line in err_lines.push(&chunk) {
                        logger.log_err(format!("[{}] {}", host, line)).await;
                    }
                }
                None => err_open = false,
            },
        }
    }

    if let Some(line) = out_lines.finish() {
        logger.log(format!("[{}] {}", host, line)).await;
    }
    if let Some(line) = err_lines.finish() {
        logger.log_err(format!("[{}] {}", host, line)).await;
    }
}

async fn collect(mut rx: mpsc::Receiver<Vec<u8>>) -> String {
    let mut buf = Vec::new();
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
