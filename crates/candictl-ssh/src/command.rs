//! Remote commands, optionally under sudo
//!
//! A sudo command is wrapped as
//! `sudo -p SudoPassword -H -S -i bash -c 'echo SUDO-SUCCESS && <cmd>'`.
//! The prompt arrives on stderr without a newline, so both streams are read
//! in raw chunks and scanned for the two markers. The password is sent once;
//! a second prompt means it was wrong and the command is killed. Stdin is
//! closed as soon as the success marker shows up.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use candictl_common::process::{execute, ExecOptions, ExecOutput};
use candictl_common::{Error, Result};

use crate::settings::SshSettings;

pub(crate) const SUDO_PROMPT: &[u8] = b"SudoPassword";
pub(crate) const SUDO_SUCCESS: &[u8] = b"SUDO-SUCCESS";

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Finds a byte pattern in a stream delivered in arbitrary chunks
#[derive(Debug)]
struct Matcher {
    pattern: &'static [u8],
    tail: Vec<u8>,
}

impl Matcher {
    fn new(pattern: &'static [u8]) -> Self {
        Self {
            pattern,
            tail: Vec::new(),
        }
    }

    /// Number of occurrences completed by `chunk`
    fn feed(&mut self, chunk: &[u8]) -> usize {
        let mut buf = std::mem::take(&mut self.tail);
        buf.extend_from_slice(chunk);

        let n = self.pattern.len();
        let mut count = 0;
        let mut consumed = 0;
        let mut i = 0;
        while i + n <= buf.len() {
            if &buf[i..i + n] == self.pattern {
                count += 1;
                i += n;
                consumed = i;
            } else {
                i += 1;
            }
        }
        let keep_from = buf.len().saturating_sub(n - 1).max(consumed);
        self.tail = buf[keep_from..].to_vec();
        count
    }
}

/// What the sudo exchange asks the caller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SudoAction {
    /// Write the password to stdin
    SendPassword,
    /// The command is running; close stdin
    Started,
    /// The password was rejected
    BadPassword,
}

/// Three-phase sudo exchange: prompt, success marker, passthrough
#[derive(Debug)]
pub(crate) struct SudoState {
    prompt: Matcher,
    success: Matcher,
    password_sent: bool,
    started: bool,
}

impl SudoState {
    pub(crate) fn new() -> Self {
        Self {
            prompt: Matcher::new(SUDO_PROMPT),
            success: Matcher::new(SUDO_SUCCESS),
            password_sent: false,
            started: false,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    /// Scan one chunk of stdout or stderr
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<SudoAction> {
        let mut actions = Vec::new();
        if self.started {
            return actions;
        }

        for _ in 0..self.prompt.feed(chunk) {
            if self.password_sent {
                actions.push(SudoAction::BadPassword);
                return actions;
            }
            self.password_sent = true;
            actions.push(SudoAction::SendPassword);
        }
        if self.success.feed(chunk) > 0 {
            self.started = true;
            actions.push(SudoAction::Started);
        }
        actions
    }
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@,+".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// One command on the remote host
#[derive(Debug, Clone)]
pub struct SshCommand {
    settings: SshSettings,
    auth_sock: Option<String>,
    name: String,
    args: Vec<String>,
    sudo: bool,
    capture_stdout: bool,
    timeout: Option<Duration>,
    stdout_sink: Option<mpsc::Sender<String>>,
}

impl SshCommand {
    pub(crate) fn new(
        settings: SshSettings,
        auth_sock: Option<String>,
        name: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            settings,
            auth_sock,
            name: name.into(),
            args,
            sudo: false,
            capture_stdout: false,
            timeout: None,
            stdout_sink: None,
        }
    }

    /// Run under sudo
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Keep stdout instead of logging it
    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    /// Send every stdout line to `sink` as it arrives
    pub fn with_stdout_lines(mut self, sink: mpsc::Sender<String>) -> Self {
        self.stdout_sink = Some(sink);
        self
    }

    /// Kill the command after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell line executed on the remote side
    pub fn remote_line(&self) -> String {
        let mut line = self.name.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if !self.sudo {
            return line;
        }
        let inner = format!("echo {} && {}", String::from_utf8_lossy(SUDO_SUCCESS), line);
        format!(
            "sudo -p {} -H -S -i bash -c {}",
            String::from_utf8_lossy(SUDO_PROMPT),
            shell_quote(&inner)
        )
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.settings.ssh_args())
            .arg(self.settings.target())
            .arg("--")
            .arg(self.remote_line());
        if let Some(sock) = &self.auth_sock {
            cmd.env("SSH_AUTH_SOCK", sock);
        }
        cmd
    }

    /// Run to completion
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ExecOutput> {
        let stop = cancel.child_token();
        let timer = self.timeout.map(|timeout| {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                stop.cancel();
            })
        });

        let result = if self.sudo || self.stdout_sink.is_some() {
            self.run_streaming(&stop).await
        } else {
            let mut opts = ExecOptions::new(format!("ssh {}", self.name));
            opts.capture_stdout = self.capture_stdout;
            execute(self.ssh(), &opts, &stop).await
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        let out = result?;
        if out.stopped && !cancel.is_cancelled() {
            return Err(Error::ssh_unavailable(
                &self.settings.host,
                format!("{} timed out", self.name),
            ));
        }
        if out.stopped {
            return Err(Error::loop_cancelled(format!("ssh {}", self.name)));
        }
        Ok(out)
    }

    /// Run and fail on a non-zero exit code
    pub async fn run_checked(&self, cancel: &CancellationToken) -> Result<ExecOutput> {
        let out = self.run(cancel).await?;
        if !out.success() {
            return Err(Error::internal_with_context(
                format!("ssh {}", self.settings.host),
                format!(
                    "{} exited with {:?}: {}",
                    self.name,
                    out.code,
                    out.stderr.trim_end()
                ),
            ));
        }
        Ok(out)
    }

    async fn run_streaming(&self, stop: &CancellationToken) -> Result<ExecOutput> {
        let mut cmd = self.ssh();
        cmd.stdin(if self.sudo { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| {
            Error::ssh_unavailable(&self.settings.host, format!("failed to start ssh: {}", e))
        })?;

        let (tx, mut rx) = mpsc::channel::<(bool, Vec<u8>)>(64);
        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump(out, false, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump(err, true, tx.clone()));
        }
        drop(tx);

        let mut stdin = child.stdin.take();
        let mut sudo = self.sudo.then(SudoState::new);
        let mut output = ExecOutput::default();
        let mut stdout_lines = LineBuffer::default();
        let password = self.settings.become_pass.clone().unwrap_or_default();

        loop {
            let chunk = tokio::select! {
                _ = stop.cancelled() => {
                    output.stopped = true;
                    terminate(&mut child).await;
                    return Ok(output);
                }
                chunk = rx.recv() => chunk,
            };
            let Some((is_stderr, data)) = chunk else {
                break;
            };

            let mut payload: &[u8] = &data;
            if let Some(state) = sudo.as_mut() {
                let was_started = state.is_started();
                for action in state.feed(&data) {
                    match action {
                        SudoAction::SendPassword => {
                            debug!("Send become pass to cmd");
                            if let Some(stdin) = stdin.as_mut() {
                                stdin.write_all(format!("{}\n", password).as_bytes()).await?;
                                stdin.flush().await?;
                            }
                        }
                        SudoAction::BadPassword => {
                            error!("Bad sudo password");
                            terminate(&mut child).await;
                            return Err(Error::ssh_unavailable(
                                &self.settings.host,
                                "bad sudo password",
                            ));
                        }
                        SudoAction::Started => {
                            debug!("Got SUDO-SUCCESS");
                            stdin = None;
                        }
                    }
                }
                if !was_started && !is_stderr {
                    if !state.is_started() {
                        continue;
                    }
                    payload = after_marker(&data);
                }
            }

            if is_stderr {
                output.stderr.push_str(&String::from_utf8_lossy(payload));
                continue;
            }
            if self.capture_stdout {
                output.stdout.extend_from_slice(payload);
            }
            for line in stdout_lines.push(payload) {
                self.emit_line(line).await;
            }
        }
        if let Some(rest) = stdout_lines.finish() {
            self.emit_line(rest).await;
        }

        output.code = child.wait().await?.code();
        Ok(output)
    }

    async fn emit_line(&self, line: String) {
        if let Some(sink) = &self.stdout_sink {
            let _ = sink.send(line).await;
        } else if !self.capture_stdout {
            info!("{}", line);
        }
    }
}

/// Output that follows the success marker line in the chunk that carried it
fn after_marker(data: &[u8]) -> &[u8] {
    let n = SUDO_SUCCESS.len();
    let end = data
        .windows(n)
        .rposition(|w| w == SUDO_SUCCESS)
        .map(|pos| pos + n)
        .unwrap_or(0);
    let rest = &data[end..];
    match rest.iter().position(|b| *b == b'\n') {
        Some(pos) => &rest[pos + 1..],
        None => &[],
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, is_stderr: bool, tx: mpsc::Sender<(bool, Vec<u8>)>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send((is_stderr, buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGINT);
    }
    if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

/// Splits a byte stream into lines
#[derive(Debug, Default)]
struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(rest)
    }
}
