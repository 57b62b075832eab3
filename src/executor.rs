//! Subprocess executor.
//!
//! Spawns a handler's command line, drains stdout and stderr concurrently
//! into bounded ring buffers, forwards notable lines into the job's log,
//! and enforces the job's wall-clock timeout (terminate, grace period, kill).
//! Failures never escape: spawn or monitor errors come back as an
//! unsuccessful outcome with `return_code = -2`.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::jobs::{Job, LogLevel};
use crate::store::JobStore;

/// Return code recorded when the timeout fired.
pub const TIMEOUT_RETURN_CODE: i32 = -1;

/// Return code recorded when the process could not be spawned or monitored.
pub const EXECUTION_ERROR_RETURN_CODE: i32 = -2;

/// Return code recorded when something other than our timeout killed the
/// process with a signal. The signal number goes in `result["signal"]`.
pub const SIGNALED_RETURN_CODE: i32 = -3;

/// Stdout lines containing this marker are forwarded to the job log at INFO.
pub const COMPLETION_MARKER: &str = "COMPLETED";

/// Stdout lines kept in `output_summary`.
const SUMMARY_LINES: usize = 10;

/// How long to wait for buffered output once the process is gone. Orphaned
/// grandchildren can hold the pipes open indefinitely.
const DRAIN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Result of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: serde_json::Value,
}

/// Fixed-capacity line buffer; the oldest line is dropped when full.
#[derive(Debug)]
struct RingBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self, n: usize) -> Vec<&str> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).map(String::as_str).collect()
    }
}

/// Spawns and monitors external commands on behalf of handlers.
pub struct SubprocessExecutor {
    config: ExecutorConfig,
    store: Arc<JobStore>,
}

impl SubprocessExecutor {
    pub fn new(config: ExecutorConfig, store: Arc<JobStore>) -> Self {
        Self { config, store }
    }

    /// Run `cmd` with exactly `env` as its environment.
    ///
    /// `success` is true only for exit code 0.
    pub async fn execute(
        &self,
        cmd: &[String],
        env: &HashMap<String, String>,
        timeout_seconds: u64,
        job: &mut Job,
    ) -> ExecutionOutcome {
        match self.run(cmd, env, timeout_seconds, job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Subprocess execution failed");
                self.log(job, LogLevel::Error, format!("Execution error: {e}"))
                    .await;
                ExecutionOutcome {
                    success: false,
                    result: json!({
                        "error": e.to_string(),
                        "return_code": EXECUTION_ERROR_RETURN_CODE,
                    }),
                }
            }
        }
    }

    async fn run(
        &self,
        cmd: &[String],
        env: &HashMap<String, String>,
        timeout_seconds: u64,
        job: &mut Job,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let (program, args) = cmd.split_first().ok_or(ExecutionError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        info!(
            job_id = %job.job_id,
            pid = child.id().unwrap_or_default(),
            timeout_seconds,
            "Subprocess started"
        );

        let (tx, mut rx) = mpsc::channel::<(Stream, String)>(256);
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut stdout_buf = RingBuffer::new(self.config.max_output_lines);
        let mut stderr_buf = RingBuffer::new(self.config.max_output_lines);

        let deadline = tokio::time::sleep(Duration::from_secs(timeout_seconds));
        tokio::pin!(deadline);

        let exit = loop {
            tokio::select! {
                Some((stream, line)) = rx.recv() => {
                    self.record(job, &mut stdout_buf, &mut stderr_buf, stream, line).await;
                }
                status = child.wait() => break Some(status?),
                _ = &mut deadline => break None,
            }
        };

        let mut signal = None;
        let (return_code, error) = match exit {
            Some(status) => match status.code() {
                Some(code) => (code, None),
                None => {
                    signal = exit_signal(&status);
                    warn!(job_id = %job.job_id, ?signal, "Subprocess killed by a signal");
                    (SIGNALED_RETURN_CODE, None)
                }
            },
            None => {
                let message = format!("Job timed out after {timeout_seconds} seconds");
                warn!(job_id = %job.job_id, timeout_seconds, "Subprocess timed out, terminating");
                self.log(job, LogLevel::Error, message.clone()).await;
                terminate(&mut child, self.config.kill_grace_period).await;
                (TIMEOUT_RETURN_CODE, Some(message))
            }
        };

        while let Ok(Some((stream, line))) =
            tokio::time::timeout(DRAIN_IDLE_TIMEOUT, rx.recv()).await
        {
            self.record(job, &mut stdout_buf, &mut stderr_buf, stream, line)
                .await;
        }
        for reader in readers {
            reader.abort();
        }

        let error = error.or_else(|| {
            (return_code != 0).then(|| {
                let tail = stderr_buf.tail(SUMMARY_LINES);
                if !tail.is_empty() {
                    tail.join("\n")
                } else if let Some(signal) = signal {
                    format!("Process killed by signal {signal}")
                } else {
                    format!("Process exited with code {return_code}")
                }
            })
        });

        info!(job_id = %job.job_id, return_code, "Subprocess finished");

        let report_id = env
            .get("DELPHI_REPORT_ID")
            .map(String::as_str)
            .unwrap_or_else(|| job.report_id_or_conversation());
        let mut result = json!({
            "return_code": return_code,
            "output_summary": stdout_buf.tail(SUMMARY_LINES).join("\n"),
            "visualization_path": format!("visualizations/{report_id}/{}", job.job_id),
            "visualization_urls": {
                "interactive": format!(
                    "{}/{report_id}/{}/layer_0_datamapplot.html",
                    self.config.visualization_base_url.trim_end_matches('/'),
                    job.job_id
                ),
            },
            "execution_finished_at": Utc::now().to_rfc3339(),
        });
        if let Some(error) = error {
            result["error"] = serde_json::Value::String(error);
        }
        if let Some(signal) = signal {
            result["signal"] = json!(signal);
        }

        Ok(ExecutionOutcome {
            success: return_code == 0,
            result,
        })
    }

    /// Buffer one line and forward it to the job log if it is notable.
    async fn record(
        &self,
        job: &mut Job,
        stdout_buf: &mut RingBuffer,
        stderr_buf: &mut RingBuffer,
        stream: Stream,
        line: String,
    ) {
        let level = match stream {
            Stream::Stderr => Some(LogLevel::Error),
            Stream::Stdout => classify_stdout(&line),
        };
        if let Some(level) = level {
            self.log(job, level, line.clone()).await;
        }
        match stream {
            Stream::Stdout => stdout_buf.push(line),
            Stream::Stderr => stderr_buf.push(line),
        }
    }

    /// Append to the job log; a failed write is reported and otherwise ignored.
    async fn log(&self, job: &mut Job, level: LogLevel, message: String) {
        if let Err(e) = self.store.update_job_logs(job, level, message).await {
            debug!(job_id = %job.job_id, error = %e, "Could not persist job log entry");
        }
    }
}

/// Level a stdout line is forwarded at, if any.
fn classify_stdout(line: &str) -> Option<LogLevel> {
    if line.contains("ERROR") {
        Some(LogLevel::Error)
    } else if line.contains("WARNING") {
        Some(LogLevel::Warning)
    } else if line.contains(COMPLETION_MARKER) {
        Some(LogLevel::Info)
    } else {
        None
    }
}

/// Lines of `pipe` with trailing `\n` / `\r\n` removed. Invalid UTF-8 is
/// replaced rather than treated as an error, so the pipe is always drained.
fn lossy_lines<R>(pipe: R) -> impl futures::Stream<Item = std::io::Result<String>>
where
    R: AsyncRead + Unpin,
{
    futures::stream::unfold(BufReader::new(pipe), |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some((Ok(String::from_utf8_lossy(&buf).into_owned()), reader))
            }
            Err(e) => Some((Err(e), reader)),
        }
    })
}

fn spawn_reader<R>(pipe: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = Box::pin(lossy_lines(pipe));
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if tx.send((stream, line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(?stream, error = %e, "Output reader stopped");
                    break;
                }
            }
        }
    })
}

/// Ask the process to exit, then force-kill it after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    if send_sigterm(child) && tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill timed-out subprocess");
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: pid is our own child and has not been reaped (id() is Some).
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
