//! Real implementations of the collaborator traits.
//!
//! [`CommandExecutor`] runs one external command per task variant, and
//! [`FileJobSource`] loads the job list from a JSON file. They implement the
//! same traits as the mocks in [`crate::testing`].
//!
//! # Command protocol
//!
//! The executor command receives the job through the environment:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `DROVER_JOB_ID` | job id |
//! | `DROVER_ACCOUNT` | account reference |
//! | `DROVER_VARIANT` | `primary` or `secondary` |
//! | `DROVER_ATTEMPT` | 1-indexed retry attempt |
//! | `DROVER_DATE_KEY` | ledger day, `YYYY-MM-DD` |
//! | `DROVER_DONE_UNITS` | JSON array of units already done today |
//! | `DROVER_JOB_CONFIG` | the job's `config` object as JSON |
//!
//! It must print a JSON object on its last stdout line:
//!
//! ```json
//! {"initialPoints": 100, "collectedPoints": 7, "completedUnits": ["daily-set"]}
//! ```
//!
//! A non-zero exit is a failure carrying the command's stderr, which is what
//! the failure classifier sees.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::interfaces::{ExecutionContext, JobSource, TaskExecutor};
use crate::job::{Job, TaskOutcome};
use crate::supervisor::partition::shared_account;

/// How the executor command is run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program to run.
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
    /// Kill the command after this long.
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_secs: 1800,
        }
    }
}

/// Task executor backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn command(&self, ctx: &ExecutionContext) -> Result<Command> {
        let done: Vec<String> = ctx
            .ledger
            .completed(&ctx.account_key, &ctx.date_key)
            .context("Failed to read the completion ledger")?
            .into_iter()
            .collect();

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env("DROVER_JOB_ID", &ctx.job.id)
            .env("DROVER_ACCOUNT", &ctx.job.account)
            .env("DROVER_VARIANT", ctx.variant.as_str())
            .env("DROVER_ATTEMPT", ctx.attempt.to_string())
            .env("DROVER_DATE_KEY", &ctx.date_key)
            .env("DROVER_DONE_UNITS", serde_json::to_string(&done)?)
            .env("DROVER_JOB_CONFIG", serde_json::to_string(&ctx.job.config)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Terminal signals sent to the worker's group must not reach the task
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<TaskOutcome> {
        if self.config.command.is_empty() {
            bail!("No executor command configured");
        }

        debug!(
            "Executing {} for job {} (attempt {})",
            ctx.variant, ctx.job.id, ctx.attempt
        );
        let child = self
            .command(ctx)?
            .spawn()
            .with_context(|| format!("Failed to start {}", self.config.command))?;

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", ctx.variant, timeout))?
            .context("Failed to wait for the executor command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                bail!("Executor exited with {}", output.status);
            }
            bail!("{}", stderr);
        }

        parse_outcome(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse the outcome from the last non-blank stdout line.
///
/// # Errors
///
/// Returns an error if stdout is empty or the last line is not an outcome.
pub fn parse_outcome(stdout: &str) -> Result<TaskOutcome> {
    let Some(last) = stdout.lines().rev().find(|line| !line.trim().is_empty()) else {
        bail!("Executor printed no outcome");
    };
    serde_json::from_str(last.trim())
        .with_context(|| format!("Executor outcome is not valid JSON: {}", last.trim()))
}

/// Loads jobs from a JSON array of `{id, account, config?}` objects.
#[derive(Debug, Clone)]
pub struct FileJobSource {
    path: PathBuf,
}

impl FileJobSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl JobSource for FileJobSource {
    fn load_jobs(&self) -> Result<Vec<Job>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read job file {}", self.path.display()))?;
        let mut jobs: Vec<Job> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse job file {}", self.path.display()))?;

        let mut seen = std::collections::HashSet::new();
        for job in &mut jobs {
            if job.id.trim().is_empty() {
                bail!("Job with account {:?} has an empty id", job.account);
            }
            if !seen.insert(job.id.clone()) {
                bail!("Duplicate job id {:?}", job.id);
            }
            job.clear_transient_flags();
        }
        if let Some((first, second)) = shared_account(&jobs) {
            bail!(
                "Jobs {:?} and {:?} refer to the same account {:?}",
                first.id,
                second.id,
                second.account.trim()
            );
        }
        Ok(jobs)
    }
}
