//! Upload a script or a bundle directory and execute it remotely

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::info;

use candictl_common::process::{execute, ExecOptions};
use candictl_common::{Error, Result};

use crate::client::SshClient;
use crate::command::shell_quote;

const REMOTE_TMP_DIR: &str = "/var/tmp";

/// A script uploaded to `/var/tmp` and run there
#[derive(Debug)]
pub struct UploadScript {
    client: SshClient,
    path: PathBuf,
    args: Vec<String>,
    sudo: bool,
    env: Vec<(String, String)>,
}

impl UploadScript {
    pub(crate) fn new(client: SshClient, path: &Path, args: &[&str]) -> Self {
        Self {
            client,
            path: path.to_path_buf(),
            args: args.iter().map(|s| s.to_string()).collect(),
            sudo: false,
            env: Vec::new(),
        }
    }

    /// Run under sudo
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Export `key=value` before running
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn file_name(&self) -> Result<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::internal_with_context(
                    "upload",
                    format!("{} has no file name", self.path.display()),
                )
            })
    }

    fn env_prefix(&self) -> String {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={} ", k, shell_quote(v)))
            .collect()
    }

    /// Upload the script and run it; returns its stdout
    pub async fn execute(&self) -> Result<Vec<u8>> {
        let name = self.file_name()?;
        let remote = format!("{}/{}", REMOTE_TMP_DIR, name);
        self.client.upload(&self.path, &remote).await?;

        let mut line = vec![
            format!("chmod +x {} &&", remote),
            format!("{}{}", self.env_prefix(), remote),
        ];
        line.extend(self.args.iter().map(|a| shell_quote(a)));
        self.run(line).await
    }

    /// Pack `parent_dir/bundle_dir`, upload it, unpack under `/var/tmp` and run
    /// the script from inside the bundle.
    pub async fn execute_bundle(&self, parent_dir: &Path, bundle_dir: &str) -> Result<Vec<u8>> {
        let script = self.file_name()?;
        let tmp = tempfile::Builder::new()
            .prefix("bundle-")
            .suffix(".tar")
            .tempfile()?
            .into_temp_path();

        let mut tar = Command::new("tar");
        tar.arg("-cpf").arg(&*tmp).arg("-C").arg(parent_dir).arg(bundle_dir);
        let out = execute(tar, &ExecOptions::new("tar"), &self.client.cancellation_token()).await?;
        if !out.success() {
            return Err(Error::internal_with_context(
                "bundle",
                format!("tar failed: {}", out.stderr.trim_end()),
            ));
        }

        let remote_tar = format!("{}/{}.tar", REMOTE_TMP_DIR, bundle_dir);
        info!("Uploading bundle {} to the host", bundle_dir);
        self.client.upload(&tmp, &remote_tar).await?;

        let bundle_path = format!("{}/{}", REMOTE_TMP_DIR, bundle_dir);
        let mut line = vec![
            format!("tar xpof {} -C {} &&", remote_tar, REMOTE_TMP_DIR),
            format!("cd {} &&", bundle_path),
            format!("{}{}/{}", self.env_prefix(), bundle_path, script),
        ];
        line.extend(self.args.iter().map(|a| shell_quote(a)));
        self.run(line).await
    }

    async fn run(&self, line: Vec<String>) -> Result<Vec<u8>> {
        let (first, rest) = line.split_first().ok_or_else(|| Error::internal("empty command"))?;
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();
        let mut cmd = self.client.command(first.clone(), &args).capture_stdout();
        if self.sudo {
            cmd = cmd.sudo();
        }
        let out = cmd.run_checked(&self.client.cancellation_token()).await?;
        Ok(out.stdout)
    }
}
