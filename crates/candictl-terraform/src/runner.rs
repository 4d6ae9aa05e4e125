//! Runner for one IaC step
//!
//! The runner drives the `terraform` binary through init, plan, apply,
//! destroy and output. The state file lives in the state cache unless a
//! state was injected with [`Runner::with_state`], so progress survives a
//! crash of candictl itself.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tempfile::TempPath;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use candictl_common::cache::Cache;
use candictl_common::input::Prompter;
use candictl_common::process::{execute, ExecOptions, DEFAULT_GRACE_PERIOD};
use candictl_common::teardown::HookGuard;
use candictl_common::{Error, MultiError, Result, DEFAULT_TMP_DIR};
use candictl_config::DEFAULT_PROVIDERS_DIR;

use crate::saver::StateSaver;

const HAS_CHANGES_EXIT_CODE: i32 = 2;

const CACHED_STATE_DECLINED: &str = "Terraform pipeline aborted. \
     To drop the cache and continue, run candictl with the --drop-cache flag";

/// What to do with a state found in the local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UseStateCache {
    /// Ask the operator
    #[default]
    Ask,
    /// Always reuse it
    Yes,
    /// Never reuse it
    No,
}

impl FromStr for UseStateCache {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ask" => Ok(Self::Ask),
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            other => Err(Error::config_invalid(format!(
                "unknown state cache policy {:?}, expected ask, yes or no",
                other
            ))),
        }
    }
}

/// Process-wide settings shared by every runner
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Root of provider layouts
    pub providers_dir: PathBuf,
    /// Directory for variables, plans and injected states
    pub tmp_dir: PathBuf,
    /// Stream stderr and enable `TF_LOG=DEBUG`
    pub debug: bool,
    /// Policy for cached states
    pub use_state_cache: UseStateCache,
    /// Time between SIGINT and SIGKILL when stopping
    pub grace_period: Duration,
    /// Program and leading arguments used to invoke the IaC tool
    pub terraform_command: Vec<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            providers_dir: PathBuf::from(DEFAULT_PROVIDERS_DIR),
            tmp_dir: PathBuf::from(DEFAULT_TMP_DIR),
            debug: false,
            use_state_cache: UseStateCache::Ask,
            grace_period: DEFAULT_GRACE_PERIOD,
            terraform_command: vec!["terraform".to_string()],
        }
    }
}

/// Cloneable handle that stops a runner from another task or a teardown hook
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    name: String,
    token: CancellationToken,
}

impl RunnerHandle {
    /// Interrupt the running subprocess and refuse further operations
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            debug!(runner = %self.name, "Runner stop requested");
        }
        self.token.cancel();
    }

    /// Whether the runner is stopped
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Deserialize)]
struct StateResources {
    #[serde(default)]
    resources: Vec<serde_json::Value>,
}

/// One IaC step bound to one working directory
pub struct Runner {
    name: String,
    prefix: String,
    step: String,
    working_dir: PathBuf,
    settings: Arc<RunnerSettings>,

    state_path: Option<PathBuf>,
    plan_path: Option<TempPath>,
    variables_path: Option<TempPath>,
    injected_state: Option<TempPath>,

    auto_approve: bool,
    allowed_cached_state: bool,
    changes_in_plan: bool,
    initialized: bool,

    cache: Arc<Cache>,
    prompter: Arc<dyn Prompter>,
    state_saver: Option<StateSaver>,
    handle: RunnerHandle,
    teardown_hook: Option<HookGuard>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("name", &self.name)
            .field("step", &self.step)
            .field("working_dir", &self.working_dir)
            .field("state_path", &self.state_path)
            .field("changes_in_plan", &self.changes_in_plan)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Runner for `step` of `layout` of `provider`
    pub fn new(
        settings: Arc<RunnerSettings>,
        cache: Arc<Cache>,
        prompter: Arc<dyn Prompter>,
        provider: &str,
        prefix: &str,
        layout: &str,
        step: &str,
    ) -> Self {
        let working_dir = settings
            .providers_dir
            .join(provider)
            .join("layouts")
            .join(layout)
            .join(step);
        Self {
            name: step.to_string(),
            prefix: prefix.to_string(),
            step: step.to_string(),
            working_dir,
            settings,
            state_path: None,
            plan_path: None,
            variables_path: None,
            injected_state: None,
            auto_approve: false,
            allowed_cached_state: false,
            changes_in_plan: false,
            initialized: false,
            cache,
            prompter,
            state_saver: None,
            handle: RunnerHandle {
                name: step.to_string(),
                token: CancellationToken::new(),
            },
            teardown_hook: None,
        }
    }

    /// Replace the state cache
    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = cache;
        self
    }

    /// Name used for the cache key and in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.handle.name = self.name.clone();
        self
    }

    /// Use an explicit state file
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Seed the runner with a state blob
    pub fn with_state(mut self, state: &[u8]) -> Result<Self> {
        let path = self.write_temp(".tfstate", state)?;
        self.state_path = Some(path.to_path_buf());
        self.injected_state = Some(path);
        Ok(self)
    }

    /// Variables passed to the IaC tool
    pub fn with_variables(mut self, variables: &[u8]) -> Result<Self> {
        self.variables_path = Some(self.write_temp(".auto.tfvars.json", variables)?);
        Ok(self)
    }

    /// Apply and destroy without asking
    pub fn with_auto_approve(mut self, flag: bool) -> Self {
        self.auto_approve = flag;
        self
    }

    /// Reuse a cached state without asking
    pub fn with_allowed_cached_state(mut self, flag: bool) -> Self {
        self.allowed_cached_state = flag;
        self
    }

    /// Stream intermediate state through `saver` during apply and destroy
    pub fn with_intermediate_state_saver(mut self, saver: StateSaver) -> Self {
        self.state_saver = Some(saver);
        self
    }

    /// Stop together with `parent`
    pub fn with_stop_token(mut self, parent: &CancellationToken) -> Self {
        self.handle.token = parent.child_token();
        self
    }

    /// Keep the teardown hook stopping this runner registered only while the
    /// runner lives
    pub fn with_teardown_hook(mut self, hook: HookGuard) -> Self {
        self.teardown_hook = Some(hook);
        self
    }

    /// Runner name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step of the layout
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Cluster prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Step directory inside the provider layout
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Current state file, if allocated
    pub fn state_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }

    /// Whether the last plan reported changes
    pub fn changes_in_plan(&self) -> bool {
        self.changes_in_plan
    }

    /// Handle for stopping this runner
    pub fn handle(&self) -> RunnerHandle {
        self.handle.clone()
    }

    /// Interrupt the subprocess and refuse further operations
    pub fn stop(&self) {
        self.handle.stop();
    }

    fn write_temp(&self, suffix: &str, data: &[u8]) -> Result<TempPath> {
        fs::create_dir_all(&self.settings.tmp_dir)?;
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-candictl.", self.step))
            .suffix(suffix)
            .tempfile_in(&self.settings.tmp_dir)?;
        fs::write(file.path(), data)?;
        Ok(file.into_temp_path())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.handle.is_stopped() {
            return Err(Error::runner_stopped(&self.name));
        }
        Ok(())
    }

    fn ensure_initialized(&self, command: &str) -> Result<()> {
        self.ensure_running()?;
        if !self.initialized {
            return Err(Error::internal_with_context(
                command,
                format!("runner {} must be initialized first", self.name),
            ));
        }
        Ok(())
    }

    fn variables_arg(&self) -> Result<String> {
        let path = self.variables_path.as_ref().ok_or_else(|| {
            Error::internal_with_context("runner", format!("no variables set for {}", self.name))
        })?;
        Ok(format!("-var-file={}", path.display()))
    }

    fn state_file(&self) -> Result<&Path> {
        self.state_path
            .as_deref()
            .ok_or_else(|| Error::state_missing("no state found, try to run terraform apply first"))
    }

    fn command(&self, args: &[String]) -> Result<Command> {
        let (program, leading) = self.settings.terraform_command.split_first().ok_or_else(|| {
            Error::internal_with_context("runner", "terraform command is empty")
        })?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(args)
            .env("TF_IN_AUTOMATION", "yes")
            .env("TF_DATA_DIR", self.settings.tmp_dir.join("tf_candictl"));
        if self.settings.debug {
            cmd.env("TF_LOG", "DEBUG");
        }
        Ok(cmd)
    }

    /// Run the tool, treating `accepted` exit codes as success
    async fn exec(&self, subcommand: &str, args: Vec<String>, accepted: &[i32]) -> Result<i32> {
        debug!(runner = %self.name, args = ?args, "Running terraform");
        let opts = ExecOptions {
            grace_period: self.settings.grace_period,
            ..ExecOptions::new(format!("terraform {}", subcommand))
        }
        .stream_stderr(self.settings.debug);

        let out = execute(self.command(&args)?, &opts, &self.handle.token).await?;
        info!("Terraform runner {:?} process exited", self.step);

        if out.stopped {
            return Err(Error::runner_stopped(&self.name));
        }
        match out.code {
            Some(0) => Ok(0),
            Some(code) if accepted.contains(&code) => Ok(code),
            code => {
                let message = if self.settings.debug {
                    "terraform has failed in DEBUG mode, search in the output above for an error"
                        .to_string()
                } else if out.stderr.trim().is_empty() {
                    format!("exit code {:?}", code)
                } else {
                    out.stderr.trim_end().to_string()
                };
                Err(Error::pipeline_failed(&self.name, subcommand, message))
            }
        }
    }

    /// Allocate the state file and run `terraform init`
    pub async fn init(&mut self) -> Result<()> {
        self.ensure_running()?;

        if self.state_path.is_none() {
            let path = self.cache.object_path(&self.name);
            if self.cache.in_cache(&self.name) {
                info!("Cached Terraform state found:\n\t{}", path.display());
                if !self.allowed_cached_state {
                    let confirmed = match self.settings.use_state_cache {
                        UseStateCache::Yes => true,
                        UseStateCache::No => false,
                        UseStateCache::Ask => self.prompter.confirm(
                            "Do you want to continue with Terraform state from local cache?",
                            true,
                        ),
                    };
                    if !confirmed {
                        return Err(Error::pipeline_aborted(&self.name, CACHED_STATE_DECLINED));
                    }
                }
            }
            self.state_path = Some(path);
        }

        let args = vec![
            "init".to_string(),
            "-get-plugins=false".to_string(),
            "-no-color".to_string(),
            "-input=false".to_string(),
            self.variables_arg()?,
            self.working_dir.display().to_string(),
        ];
        self.exec("init", args, &[])
            .instrument(info_span!("terraform_init", runner = %self.name))
            .await?;
        self.initialized = true;
        Ok(())
    }

    /// Run `terraform plan`; returns whether the plan has changes
    pub async fn plan(&mut self) -> Result<bool> {
        self.ensure_initialized("plan")?;

        fs::create_dir_all(&self.settings.tmp_dir)?;
        let plan = tempfile::Builder::new()
            .prefix(&format!("{}-candictl.", self.step))
            .suffix(".tfplan")
            .tempfile_in(&self.settings.tmp_dir)?
            .into_temp_path();

        let args = vec![
            "plan".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-detailed-exitcode".to_string(),
            self.variables_arg()?,
            format!("-state={}", self.state_file()?.display()),
            format!("-out={}", plan.display()),
            self.working_dir.display().to_string(),
        ];
        let code = self
            .exec("plan", args, &[HAS_CHANGES_EXIT_CODE])
            .instrument(info_span!("terraform_plan", runner = %self.name))
            .await?;

        self.changes_in_plan = code == HAS_CHANGES_EXIT_CODE;
        self.plan_path = Some(plan);
        Ok(self.changes_in_plan)
    }

    /// Run `terraform apply` and save the resulting state to the cache
    pub async fn apply(&mut self) -> Result<()> {
        self.ensure_initialized("apply")?;

        if self.changes_in_plan
            && !self.auto_approve
            && !self
                .prompter
                .confirm("Do you want to CHANGE objects state in the cloud?", false)
        {
            return Err(Error::pipeline_aborted(&self.name, "terraform apply aborted"));
        }

        let state_path = self.state_file()?.to_path_buf();
        let mut args = vec![
            "apply".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-auto-approve".to_string(),
            format!("-state={}", state_path.display()),
            format!("-state-out={}", state_path.display()),
        ];
        match &self.plan_path {
            Some(plan) => args.push(plan.display().to_string()),
            None => {
                args.push(self.variables_arg()?);
                args.push(self.working_dir.display().to_string());
            }
        }

        if let Some(saver) = self.state_saver.as_mut() {
            saver.start(&state_path);
        }
        let result = self
            .exec("apply", args, &[])
            .instrument(info_span!("terraform_apply", runner = %self.name))
            .await;
        if let Some(saver) = self.state_saver.as_mut() {
            saver.stop().await;
        }

        let mut errors = MultiError::new();
        if let Err(e) = result {
            if e.is_cancellation() {
                self.save_state_to_cache(&state_path);
                return Err(e);
            }
            errors.push(e);
        }
        match fs::read(&state_path) {
            Ok(data) => {
                if let Err(e) = self.cache.save(&self.name, &data) {
                    errors.push(e);
                }
            }
            Err(e) => errors.push(e.into()),
        }

        errors.into_flat_result()
    }

    fn save_state_to_cache(&self, state_path: &Path) {
        match fs::read(state_path) {
            Ok(data) => {
                if let Err(e) = self.cache.save(&self.name, &data) {
                    warn!(runner = %self.name, error = %e, "Failed to save state to cache");
                }
            }
            Err(e) => warn!(runner = %self.name, error = %e, "Failed to read state"),
        }
    }

    /// Run `terraform destroy`. The runner is stopped afterwards.
    pub async fn destroy(&mut self) -> Result<()> {
        self.ensure_initialized("destroy")?;

        let state_path = self.state_file()?.to_path_buf();
        if !state_path.exists() {
            return Err(Error::state_missing(format!(
                "no state found for {}, try to run terraform apply first",
                self.name
            )));
        }

        if !self.auto_approve
            && !self
                .prompter
                .confirm("Do you want to DELETE objects from the cloud?", false)
        {
            return Err(Error::pipeline_aborted(&self.name, "terraform destroy aborted"));
        }

        let args = vec![
            "destroy".to_string(),
            "-no-color".to_string(),
            "-auto-approve".to_string(),
            self.variables_arg()?,
            format!("-state={}", state_path.display()),
            self.working_dir.display().to_string(),
        ];

        if let Some(saver) = self.state_saver.as_mut() {
            saver.start(&state_path);
        }
        let result = self
            .exec("destroy", args, &[])
            .instrument(info_span!("terraform_destroy", runner = %self.name))
            .await;
        if let Some(saver) = self.state_saver.as_mut() {
            saver.stop().await;
        }

        self.handle.stop();
        result.map(|_| ())
    }

    /// Raw JSON of output `name`
    pub async fn get_output(&self, name: &str) -> Result<Vec<u8>> {
        self.ensure_running()?;
        let state_path = self.state_file()?;

        let args = vec![
            "output".to_string(),
            "-no-color".to_string(),
            "-json".to_string(),
            format!("-state={}", state_path.display()),
            name.to_string(),
        ];
        let opts = ExecOptions::new("terraform output").capture_stdout();
        let out = execute(self.command(&args)?, &opts, &self.handle.token).await?;
        if out.stopped {
            return Err(Error::runner_stopped(&self.name));
        }
        if !out.success() {
            return Err(Error::pipeline_failed(
                &self.name,
                "output",
                format!("can't get terraform output for {:?}: {}", name, out.stderr.trim_end()),
            ));
        }
        Ok(out.stdout)
    }

    /// Number of resources recorded in the state file; 0 when unreadable
    pub fn resources_quantity_in_state(&self) -> usize {
        let Some(path) = self.state_path.as_deref() else {
            return 0;
        };
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                debug!(runner = %self.name, error = %e, "State file is not readable");
                return 0;
            }
        };
        if data.is_empty() {
            return 0;
        }
        match serde_json::from_slice::<StateResources>(&data) {
            Ok(state) => state.resources.len(),
            Err(e) => {
                warn!(runner = %self.name, error = %e, "State file is not valid JSON");
                0
            }
        }
    }

    /// Content of the state file
    pub fn get_state(&self) -> Result<Vec<u8>> {
        Ok(fs::read(self.state_file()?)?)
    }

    /// Keep temporary files on disk after the runner is dropped
    pub fn keep_temp_files(&mut self) {
        for path in [
            self.plan_path.take(),
            self.variables_path.take(),
            self.injected_state.take(),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = path.keep() {
                warn!(error = %e, "Failed to keep temporary file");
            }
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if self.settings.debug {
            self.keep_temp_files();
        }
    }
}
