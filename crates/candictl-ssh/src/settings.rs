//! Connection settings and the common `ssh` argument list

use std::path::{Path, PathBuf};

/// Where and how to connect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshSettings {
    /// Target host
    pub host: String,
    /// Login user
    pub user: String,
    /// Target port, `None` for the ssh default
    pub port: Option<u16>,
    /// Private keys loaded into the agent
    pub private_keys: Vec<PathBuf>,
    /// Jump host
    pub bastion_host: Option<String>,
    /// Jump host user, defaults to `user`
    pub bastion_user: Option<String>,
    /// Jump host port
    pub bastion_port: Option<u16>,
    /// Extra `-o` options, comma separated
    pub extra_args: Option<String>,
    /// Password for sudo prompts
    pub become_pass: Option<String>,
}

impl SshSettings {
    /// Settings for `user@host`
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    /// `user@host[:port]`, also used as the identity of the destroy cache
    pub fn destination(&self) -> String {
        match self.port {
            Some(port) => format!("{}@{}:{}", self.user, self.host, port),
            None => format!("{}@{}", self.user, self.host),
        }
    }

    /// Arguments shared by `ssh` invocations, without the destination.
    ///
    /// `auth_sock` is passed through the environment, not here.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "ServerAliveInterval=10",
            "-o",
            "ServerAliveCountMax=3",
            "-o",
            "ConnectTimeout=15",
            "-o",
            "BatchMode=yes",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(jump) = self.proxy_jump() {
            args.push("-J".to_string());
            args.push(jump);
        }
        for option in self.extra_options() {
            args.push("-o".to_string());
            args.push(option);
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args
    }

    /// Arguments for `scp`; the port flag is `-P` there
    pub fn scp_args(&self) -> Vec<String> {
        self.ssh_args()
            .into_iter()
            .map(|arg| if arg == "-p" { "-P".to_string() } else { arg })
            .collect()
    }

    /// `user@host`
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn proxy_jump(&self) -> Option<String> {
        let host = self.bastion_host.as_deref().filter(|h| !h.is_empty())?;
        let user = self.bastion_user.as_deref().unwrap_or(&self.user);
        Some(match self.bastion_port {
            Some(port) => format!("{}@{}:{}", user, host, port),
            None => format!("{}@{}", user, host),
        })
    }

    fn extra_options(&self) -> Vec<String> {
        self.extra_args
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Expand a leading `~/` with `$HOME`
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
