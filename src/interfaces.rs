//! Trait seams for the collaborators the orchestrator consumes.
//!
//! The login flow, task discovery, notification delivery and job loading
//! all live outside the core. They are reached through these narrow traits
//! so the pipeline, worker and supervisor can be tested with the mocks in
//! [`crate::testing`].

use anyhow::Result;
use async_trait::async_trait;

use crate::classify::FailureClass;
use crate::job::{Job, ResultSummary, TaskOutcome, Variant};
use crate::ledger::JobLedger;

/// Everything an executor needs to run one variant of one job.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job: Job,
    pub variant: Variant,
    /// 1-indexed attempt number within the retry policy.
    pub attempt: u32,
    /// Calendar day the run belongs to.
    pub date_key: String,
    /// Ledger key derived from `job.account`.
    pub account_key: String,
    pub ledger: JobLedger,
}

impl ExecutionContext {
    /// Whether a work unit was already completed today for this account.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn is_done(&self, work_unit: &str) -> crate::Result<bool> {
        self.ledger
            .is_done(&self.account_key, &self.date_key, work_unit)
    }

    /// Record a completed work unit. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be written.
    pub fn mark_done(&self, work_unit: &str) -> crate::Result<bool> {
        self.ledger
            .mark_done(&self.account_key, &self.date_key, work_unit)
    }
}

/// Runs one task variant against an account.
///
/// # Example
///
/// ```rust,ignore
/// struct Noop;
///
/// #[async_trait]
/// impl TaskExecutor for Noop {
///     async fn execute(&self, _ctx: &ExecutionContext) -> Result<TaskOutcome> {
///         Ok(TaskOutcome::new(0, 0))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `ctx.variant` for `ctx.job`.
    ///
    /// # Errors
    ///
    /// Any error is classified by the pipeline; it never escapes the batch.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<TaskOutcome>;
}

/// Pure classifier turning an executor error into a failure class.
pub trait FailureClassifier: Send + Sync {
    /// Classify an error raised by an executor.
    fn classify(&self, error: &anyhow::Error) -> FailureClass;
}

/// Fire-and-forget alert channel (ban/compromise escalations).
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver an alert.
    ///
    /// # Errors
    ///
    /// Delivery errors are logged by the caller and otherwise ignored.
    async fn send_alert(&self, title: &str, body: &str) -> Result<()>;
}

/// Fire-and-forget sink for the end-of-run conclusion.
#[async_trait]
pub trait ConclusionSink: Send + Sync {
    /// Deliver the final per-job summaries.
    ///
    /// # Errors
    ///
    /// Delivery errors are logged by the caller and otherwise ignored.
    async fn send_conclusion(&self, summaries: &[ResultSummary]) -> Result<()>;
}

/// Source of the jobs for one run, invoked once at process start.
pub trait JobSource {
    /// Load every job for this run.
    ///
    /// # Errors
    ///
    /// Returns an error if the job list cannot be read or parsed.
    fn load_jobs(&self) -> Result<Vec<Job>>;
}
