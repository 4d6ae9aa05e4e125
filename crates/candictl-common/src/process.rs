//! External process execution
//!
//! Every child runs as the leader of its own process group so that a Ctrl-C
//! in the terminal is not delivered to it twice. Stdout and stderr are read
//! by separate tasks. Stopping sends SIGINT to the group and escalates to
//! SIGKILL after a grace period.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// How long a stopped child may take to exit after SIGINT
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// What to do with the child's output
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Name used in log lines
    pub name: String,
    /// Keep stdout in memory instead of logging it
    pub capture_stdout: bool,
    /// Log stderr at debug level instead of buffering it
    pub stream_stderr: bool,
    /// Time between SIGINT and SIGKILL
    pub grace_period: Duration,
}

impl ExecOptions {
    /// Log stdout, buffer stderr
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capture_stdout: false,
            stream_stderr: false,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Keep stdout in memory
    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    /// Stream stderr at debug level
    pub fn stream_stderr(mut self, stream: bool) -> Self {
        self.stream_stderr = stream;
        self
    }
}

/// Result of a finished process
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Captured stdout (empty unless requested)
    pub stdout: Vec<u8>,
    /// Buffered stderr (empty when streamed)
    pub stderr: String,
    /// The process was asked to stop before it finished
    pub stopped: bool,
}

impl ExecOutput {
    /// Exit code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let Ok(raw) = i32::try_from(pid) else { return };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!(pid, signal = signal.as_str(), error = %e, "Failed to signal process group");
    }
}

/// Run `cmd` to completion, honouring `stop`.
pub async fn execute(
    mut cmd: Command,
    opts: &ExecOptions,
    stop: &CancellationToken,
) -> Result<ExecOutput> {
    if stop.is_cancelled() {
        return Ok(ExecOutput {
            stopped: true,
            ..Default::default()
        });
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        Error::internal_with_context(
            "execute",
            format!("failed to start {}: {}", opts.name, e),
        )
    })?;
    let pid = child.id();
    debug!(name = %opts.name, pid = ?pid, "Process started");

    let stdout = child.stdout.take();
    let capture = opts.capture_stdout;
    let stdout_task = tokio::spawn(async move {
        let mut captured = Vec::new();
        if let Some(out) = stdout {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if capture {
                    captured.extend_from_slice(line.as_bytes());
                    captured.push(b'\n');
                } else {
                    info!("{}", line);
                }
            }
        }
        captured
    });

    let stderr = child.stderr.take();
    let stream = opts.stream_stderr;
    let stderr_task = tokio::spawn(async move {
        let mut buffered = String::new();
        if let Some(err) = stderr {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stream {
                    debug!("{}", line);
                } else {
                    buffered.push_str(&line);
                    buffered.push('\n');
                }
            }
        }
        buffered
    });

    let finished: Option<std::io::Result<ExitStatus>> = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop.cancelled() => None,
    };

    let (status, stopped) = match finished {
        Some(status) => (status?, false),
        None => {
            info!(name = %opts.name, "Interrupting process");
            signal_group(pid, Signal::SIGINT);
            match tokio::time::timeout(opts.grace_period, child.wait()).await {
                Ok(status) => (status?, true),
                Err(_) => {
                    warn!(name = %opts.name, "Process did not exit after SIGINT, killing");
                    signal_group(pid, Signal::SIGKILL);
                    let _ = child.start_kill();
                    (child.wait().await?, true)
                }
            }
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    debug!(name = %opts.name, code = ?status.code(), "Process exited");
    Ok(ExecOutput {
        code: status.code(),
        stdout,
        stderr,
        stopped,
    })
}
