//! Seam to the external execution engine.
//!
//! The queue hands each admitted task to a [`TaskExecutor`] together with
//! an event channel and a cancellation token. [`ProcessExecutor`] runs a
//! configured CLI and interprets its stdout as newline-delimited JSON:
//!
//! ```text
//! {"type":"progress","message":"editing src/lib.rs","percent":40}
//! {"type":"result","sessionId":"s-1","inputTokens":1200,"outputTokens":300,"estimatedCost":"0.04"}
//! anything else                      -> forwarded verbatim as a stream chunk
//! ```
//!
//! Output is decoded lossily, so stray non-UTF-8 bytes never fail a task,
//! and a line longer than [`MAX_LINE_BYTES`] is cut and marked.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;
use crate::protocol::payloads::TaskSubmit;

/// Default wall-clock allowance per task.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Bytes of stderr kept for error messages.
const STDERR_TAIL: usize = 4096;

/// Longest stdout line kept; the rest of the line is discarded.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const TRUNCATED_MARKER: &str = " [line truncated]";

/// Environment shared between the runtime (which applies `env:update`)
/// and the executor (which hands it to every spawned process).
pub type SharedEnv = Arc<RwLock<HashMap<String, String>>>;

/// Intermediate output of a running task.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Progress {
        message: String,
        percent: Option<u8>,
        estimated_cost: Option<Decimal>,
    },
    Stream {
        chunk: String,
    },
}

/// Metrics reported by a successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOutcome {
    pub session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: Decimal,
    pub files_changed: Vec<String>,
    pub commands_run: Vec<String>,
    pub summary: Option<String>,
}

/// Runs one task to completion.
///
/// Implementations must return promptly with [`ExecutionError::Cancelled`]
/// once `cancel` fires.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &TaskSubmit,
        events: mpsc::Sender<ExecutionEvent>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError>;
}

/// Spawns a CLI per task. The prompt is the last argument; task metadata
/// travels in `FLEET_*` environment variables.
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
    env: SharedEnv,
}

impl std::fmt::Debug for ProcessExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessExecutor")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
            env: SharedEnv::default(),
        }
    }

    /// Arguments placed before the prompt.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Working directory used when the task does not name one.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share an environment map with the runtime.
    pub fn with_env(mut self, env: SharedEnv) -> Self {
        self.env = env;
        self
    }

    async fn build_command(&self, task: &TaskSubmit) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(&task.prompt);

        let workdir = task
            .working_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.working_dir.clone());
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }

        for (key, value) in self.env.read().await.iter() {
            command.env(key, value);
        }
        command
            .env("FLEET_TASK_ID", &task.task_id)
            .env("FLEET_PROJECT_ID", &task.project_id)
            .env("FLEET_BOT_NAME", &task.bot_name)
            .env("FLEET_COMMAND", &task.command);
        if let Some(session) = &task.session_id {
            command.env("FLEET_SESSION_ID", session);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn execute(
        &self,
        task: &TaskSubmit,
        events: mpsc::Sender<ExecutionEvent>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let mut child = self
            .build_command(task)
            .await
            .spawn()
            .map_err(|e| ExecutionError::SpawnFailed {
                reason: format!("{}: {}", self.program, e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ExecutionError::SpawnFailed {
            reason: "stdout not captured".to_string(),
        })?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                let start = buf.len().saturating_sub(STDERR_TAIL);
                String::from_utf8_lossy(&buf[start..]).trim().to_string()
            })
        });

        let mut stdout = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut outcome = ExecutionOutcome::default();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ExecutionError::Cancelled);
                }
                _ = &mut deadline => {
                    let _ = child.kill().await;
                    return Err(ExecutionError::Timeout(self.timeout));
                }
                line = read_capped_line(&mut stdout, &mut buf, MAX_LINE_BYTES) => {
                    match line? {
                        Some(line) => match parse_line(&line) {
                            OutputLine::Result(result) => outcome = *result,
                            OutputLine::Event(event) => {
                                // Receiver gone means the queue stopped listening; keep draining.
                                let _ = events.send(event).await;
                            }
                            OutputLine::Empty => {}
                        },
                        None => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ExecutionError::Cancelled);
            }
            status = child.wait() => status?,
        };

        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(outcome)
        } else {
            let reason = if stderr.is_empty() {
                format!("{} exited with {}", self.program, status)
            } else {
                stderr
            };
            Err(ExecutionError::Failed { reason })
        }
    }
}

/// Read one line, newline stripped, keeping at most `limit` bytes of it.
/// None at end of output.
async fn read_capped_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }

    let truncated = buf.last() != Some(&b'\n') && buf.len() > limit;
    if truncated {
        buf.truncate(limit);
        skip_line(reader).await?;
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }

    let mut line = String::from_utf8_lossy(buf).into_owned();
    if truncated {
        line.push_str(TRUNCATED_MARKER);
    }
    Ok(Some(line))
}

/// Discard input up to and including the next newline.
async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

enum OutputLine {
    Event(ExecutionEvent),
    Result(Box<ExecutionOutcome>),
    Empty,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressLine {
    message: String,
    #[serde(default)]
    percent: Option<u8>,
    #[serde(default)]
    estimated_cost: Option<Decimal>,
}

fn parse_line(line: &str) -> OutputLine {
    if line.trim().is_empty() {
        return OutputLine::Empty;
    }

    let stream = || {
        OutputLine::Event(ExecutionEvent::Stream {
            chunk: line.to_string(),
        })
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return stream();
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("progress") => match serde_json::from_value::<ProgressLine>(value) {
            Ok(p) => OutputLine::Event(ExecutionEvent::Progress {
                message: p.message,
                percent: p.percent.map(|v| v.min(100)),
                estimated_cost: p.estimated_cost,
            }),
            Err(_) => stream(),
        },
        Some("result") => match serde_json::from_value::<ExecutionOutcome>(value) {
            Ok(outcome) => OutputLine::Result(Box::new(outcome)),
            Err(_) => stream(),
        },
        _ => stream(),
    }
}
