//! OS child process as the sandbox.
//!
//! The child speaks raw messages as JSON lines: host → child on stdin,
//! child → host on stdout. The host stamps the job id as `sender` on
//! everything read from stdout, so a child cannot impersonate anyone.
//! Stderr is forwarded to the log. The child starts with an empty
//! environment plus the explicitly configured variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{SandboxControl, SandboxInstance, SandboxRuntime, HOST_IDENTITY};
use crate::error::{ExecutionError, Result};
use crate::transport::{MessagePort, RawMessage};

/// Lines longer than this are skipped without being buffered.
const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, PartialEq)]
enum LineRead {
    /// `line` holds the next line, without its newline.
    Line,
    /// A line over the cap was skipped.
    Oversized,
    Eof,
}

/// Reads one `\n`-terminated line into `line`, holding at most `max + 1`
/// bytes of it in memory.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', line)
        .await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        return Ok(LineRead::Line);
    }
    if line.len() <= max {
        // Last line, unterminated.
        return Ok(LineRead::Line);
    }

    line.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let (consumed, done) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        reader.consume(consumed);
        if done {
            break;
        }
    }
    Ok(LineRead::Oversized)
}

#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl ProcessRuntime {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.env_clear();
        cmd.envs(&self.env);
        cmd
    }
}

/// Kill switch for a sandbox process. Carries the reason for the kill.
struct ProcessControl {
    kill: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl SandboxControl for ProcessControl {
    async fn terminate(&self) {
        let _ = self.kill.send("terminated by host".to_string());
    }
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    async fn create(&self, job_id: &str) -> Result<SandboxInstance> {
        let mut child = self.command().spawn().map_err(|e| {
            ExecutionError::Runtime(format!("failed to spawn {}: {e}", self.program.display()))
        })?;
        let pid = child.id();
        info!(job = %job_id, ?pid, program = %self.program.display(), "sandbox process started");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::Runtime("stdin pipe not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Runtime("stdout pipe not available".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::Runtime("stderr pipe not available".into()))?;

        let (host_tx, mut to_child) = mpsc::unbounded_channel::<RawMessage>();
        let (from_child, host_rx) = mpsc::unbounded_channel::<RawMessage>();

        // host → child
        let job = job_id.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = to_child.recv().await {
                let mut line = match serde_json::to_vec(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(job = %job, "cannot encode message for sandbox: {e}");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = stdin.write_all(&line).await {
                    debug!(job = %job, "sandbox stdin closed: {e}");
                    break;
                }
            }
        });

        // child → host
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<String>();
        let job = job_id.to_string();
        let kill = kill_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                match read_line(&mut reader, &mut line, MAX_LINE_LENGTH).await {
                    Ok(LineRead::Line) => {}
                    Ok(LineRead::Oversized) => {
                        warn!(job = %job, "dropping oversized line from sandbox");
                        continue;
                    }
                    Ok(LineRead::Eof) => break,
                    Err(e) => {
                        warn!(job = %job, "error reading sandbox stdout: {e}");
                        let _ = kill.send(format!("sandbox stdout failed: {e}"));
                        break;
                    }
                }
                match serde_json::from_slice::<RawMessage>(&line) {
                    Ok(mut message) => {
                        message.sender = Some(job.clone());
                        if from_child.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(job = %job, "dropping non-message line from sandbox: {e}"),
                }
            }
            debug!(job = %job, "sandbox stdout closed");
        });

        let job = job_id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            loop {
                match read_line(&mut reader, &mut line, MAX_LINE_LENGTH).await {
                    Ok(LineRead::Line) => {
                        warn!(job = %job, "sandbox: {}", String::from_utf8_lossy(&line))
                    }
                    Ok(LineRead::Oversized) => warn!(job = %job, "sandbox: <oversized line>"),
                    Ok(LineRead::Eof) | Err(_) => break,
                }
            }
        });

        // Exit watchdog. Dropping the control handle kills the child too,
        // once the stdout pump has let go of its kill sender.
        let (exit_tx, exit_rx) = oneshot::channel();
        let job = job_id.to_string();
        tokio::spawn(async move {
            let reason = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => format!("sandbox process exited with {status}"),
                    Err(e) => format!("waiting on sandbox process failed: {e}"),
                },
                why = kill_rx.recv() => {
                    if let Err(e) = child.kill().await {
                        warn!(job = %job, "failed to kill sandbox process: {e}");
                    }
                    let why = why.unwrap_or_else(|| "sandbox control dropped".to_string());
                    format!("sandbox process killed: {why}")
                }
            };
            debug!(job = %job, "{reason}");
            let _ = exit_tx.send(reason);
        });

        Ok(SandboxInstance {
            port: MessagePort::new(HOST_IDENTITY, host_tx, host_rx),
            exit: exit_rx,
            control: Box::new(ProcessControl { kill: kill_tx }),
        })
    }
}

/// Guest side of the process runtime: a port over this process's stdio.
///
/// Must be called from within a tokio runtime. Nothing else in the
/// process may write to stdout.
pub fn stdio_port(identity: &str) -> MessagePort {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RawMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<RawMessage>();

    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let Ok(mut line) = serde_json::to_vec(&message) else {
                continue;
            };
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut reader = BufReader::new(tokio::io::stdin());
        let mut line = Vec::new();
        loop {
            match read_line(&mut reader, &mut line, MAX_LINE_LENGTH).await {
                Ok(LineRead::Line) => {}
                Ok(LineRead::Oversized) => {
                    debug!("dropping oversized line from host");
                    continue;
                }
                Ok(LineRead::Eof) | Err(_) => break,
            }
            match serde_json::from_slice::<RawMessage>(&line) {
                Ok(message) => {
                    if in_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => debug!("dropping non-message line from host: {e}"),
            }
        }
    });

    MessagePort::new(identity, out_tx, in_rx)
}
