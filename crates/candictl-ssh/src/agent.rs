//! Private ssh-agent holding the operator's keys

use std::path::PathBuf;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use candictl_common::process::{execute, ExecOptions};
use candictl_common::{Error, Result};

use crate::settings::expand_home;

/// A running `ssh-agent`
#[derive(Debug)]
pub struct Agent {
    auth_sock: String,
    pid: Option<i32>,
}

impl Agent {
    /// Spawn an agent and load `keys` into it
    pub async fn start(keys: &[PathBuf], cancel: &CancellationToken) -> Result<Self> {
        let mut cmd = Command::new("ssh-agent");
        cmd.arg("-s");
        let out = execute(cmd, &ExecOptions::new("ssh-agent").capture_stdout(), cancel).await?;
        if !out.success() {
            return Err(Error::ssh_unavailable(
                "localhost",
                format!("ssh-agent failed: {}", out.stderr.trim_end()),
            ));
        }

        let (auth_sock, pid) = parse_agent_output(&String::from_utf8_lossy(&out.stdout))
            .ok_or_else(|| {
                Error::ssh_unavailable("localhost", "cannot parse ssh-agent output")
            })?;
        debug!(auth_sock = %auth_sock, pid = ?pid, "ssh-agent started");
        let agent = Self { auth_sock, pid };

        for key in keys {
            let key = expand_home(key);
            let mut cmd = Command::new("ssh-add");
            cmd.arg(&key).env("SSH_AUTH_SOCK", &agent.auth_sock);
            let out = execute(cmd, &ExecOptions::new("ssh-add"), cancel).await?;
            if !out.success() {
                return Err(Error::ssh_unavailable(
                    "localhost",
                    format!("cannot add key {}: {}", key.display(), out.stderr.trim_end()),
                ));
            }
            info!("SSH key {} added", key.display());
        }

        Ok(agent)
    }

    /// Value for `SSH_AUTH_SOCK`
    pub fn auth_sock(&self) -> &str {
        &self.auth_sock
    }

    /// Kill the agent. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(pid) = self.pid.take() {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(pid, error = %e, "Failed to stop ssh-agent");
            }
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Extract `SSH_AUTH_SOCK` and `SSH_AGENT_PID` from `ssh-agent -s` output
pub(crate) fn parse_agent_output(output: &str) -> Option<(String, Option<i32>)> {
    let value = |name: &str| -> Option<String> {
        output.split(';').map(str::trim).find_map(|part| {
            part.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::to_string)
        })
    };
    let sock = value("SSH_AUTH_SOCK")?;
    let pid = value("SSH_AGENT_PID").and_then(|p| p.parse().ok());
    Some((sock, pid))
}
