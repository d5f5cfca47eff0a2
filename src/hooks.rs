//! Post-run hook.
//!
//! After final aggregation the supervisor can run one shell command, e.g. to
//! push the run report somewhere or kick off a follow-up job. The report is
//! piped to the command's stdin as JSON and a few totals are exported as
//! environment variables:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `DROVER_RUN_ID` | run identifier |
//! | `DROVER_JOBS` | jobs reported |
//! | `DROVER_TOTAL_COLLECTED` | points collected across jobs |
//! | `DROVER_BANNED_JOBS` | comma-separated ids of banned jobs |
//! | `DROVER_ERROR_JOBS` | comma-separated ids of jobs with errors |

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{DroverError, Result};
use crate::supervisor::report::RunReport;

const HOOK_NAME: &str = "post_run";

/// Configured post-run command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRunHook {
    /// Shell command line.
    pub command: String,
    /// How long the command may run.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

/// What the hook command reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookResult {
    pub stdout: String,
    pub stderr: String,
}

impl PostRunHook {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_secs: default_timeout_secs(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Run the command with the report on stdin.
    ///
    /// # Errors
    ///
    /// Returns [`DroverError::Hook`] if the command cannot start, exits
    /// non-zero or exceeds its timeout.
    pub async fn run(&self, report: &RunReport) -> Result<HookResult> {
        let payload = serde_json::to_vec(report)?;
        let join_ids = |summaries: Vec<&crate::job::ResultSummary>| {
            summaries
                .iter()
                .map(|s| s.job_id.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };

        debug!("Running post-run hook: {}", self.command);
        let mut child = shell(&self.command)
            .env("DROVER_RUN_ID", &report.run_id)
            .env("DROVER_JOBS", report.summaries.len().to_string())
            .env("DROVER_TOTAL_COLLECTED", report.total_collected().to_string())
            .env("DROVER_BANNED_JOBS", join_ids(report.banned_jobs()))
            .env("DROVER_ERROR_JOBS", join_ids(report.jobs_with_errors()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DroverError::hook(HOOK_NAME, format!("failed to start: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A hook that ignores stdin closes the pipe early
            if let Err(e) = stdin.write_all(&payload).await {
                debug!("Hook did not read the report: {}", e);
            }
        }

        let timeout = Duration::from_secs(self.timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| DroverError::hook(HOOK_NAME, format!("timed out after {timeout:?}")))?
            .map_err(|e| DroverError::hook(HOOK_NAME, e.to_string()))?;

        let result = HookResult {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if !output.status.success() {
            return Err(DroverError::hook(
                HOOK_NAME,
                format!("exited with {}: {}", output.status, result.stderr),
            ));
        }

        info!("Post-run hook finished");
        Ok(result)
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
