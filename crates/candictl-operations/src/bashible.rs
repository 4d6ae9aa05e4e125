//! Remote bootstrap of the first master with the bashible bundle

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use candictl_common::{Error, Result};
use candictl_config::MetaConfig;
use candictl_ssh::SshClient;

/// Default location of the bundle templates
pub const DEFAULT_BASHIBLE_DIR: &str = "/deckhouse/candi/bashible";

const BASHIBLE_SCRIPT: &str = "bashible.sh";
const BUNDLE_DIR: &str = "bashible";
const REMOTE_BASHIBLE: &str = "/var/lib/bashible/bashible.sh";
const CHECK_TIMEOUT: Duration = Duration::from_secs(20);

const UP_TO_DATE_MARKERS: [&str; 2] = [
    "Can't acquire lockfile /var/lock/bashible.",
    "Configuration is in sync, nothing to do.",
];

/// Whether the first line printed by a local bashible run says the node is
/// already configured
pub fn bashible_up_to_date(first_line: &str) -> bool {
    let line = first_line.trim();
    UP_TO_DATE_MARKERS.iter().any(|m| line == *m)
}

/// Copy the templates into `<work_dir>/var/lib/bashible` and write the
/// bundle values next to them. Returns the parent of the bundle directory.
pub fn prepare_bundle(meta: &MetaConfig, templates: &Path, work_dir: &Path, node_ip: Option<&str>) -> Result<PathBuf> {
    let parent = work_dir.join("var").join("lib");
    let bundle = parent.join(BUNDLE_DIR);
    if bundle.exists() {
        fs::remove_dir_all(&bundle)?;
    }
    copy_dir(templates, &bundle)?;

    let values = meta.config_for_bashible_bundle(&meta.deckhouse_config.bundle, node_ip);
    let rendered =
        serde_yaml::to_string(&values).map_err(|e| Error::serialization_for("variables.yaml", e.to_string()))?;
    fs::write(bundle.join("variables.yaml"), rendered)?;

    if !bundle.join(BASHIBLE_SCRIPT).exists() {
        return Err(Error::config_invalid(format!(
            "{} has no {}",
            templates.display(),
            BASHIBLE_SCRIPT
        )));
    }
    debug!(dir = %bundle.display(), "Bashible bundle prepared");
    Ok(parent)
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Whether bashible already ran on the host behind `ssh`
pub async fn check_bashible(ssh: &SshClient) -> bool {
    let out = ssh
        .command(REMOTE_BASHIBLE, &["--local"])
        .sudo()
        .capture_stdout()
        .with_timeout(CHECK_TIMEOUT)
        .run(&ssh.cancellation_token())
        .await;
    match out {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .lines()
            .next()
            .is_some_and(bashible_up_to_date),
        Err(e) => {
            debug!(error = %e, "Bashible is not installed yet");
            false
        }
    }
}

/// Upload and run the bundle unless the node is already configured
pub async fn execute_bashible_bundle(
    ssh: &SshClient,
    meta: &MetaConfig,
    templates: &Path,
    work_dir: &Path,
    node_ip: Option<&str>,
) -> Result<()> {
    if check_bashible(ssh).await {
        warn!("[Bashible] Node is already configured, skipping the bundle");
        return Ok(());
    }

    let parent = prepare_bundle(meta, templates, work_dir, node_ip)?;
    info!("[Bashible] Running the bundle on {}", ssh.settings().host);
    ssh.upload_script(BASHIBLE_SCRIPT, &["--local"])
        .sudo()
        .execute_bundle(&parent, BUNDLE_DIR)
        .await?;
    info!("[Bashible] Done");
    Ok(())
}
