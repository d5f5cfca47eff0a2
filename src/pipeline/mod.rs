//! Account task pipeline.
//!
//! This module contains the per-job state machine and the batch loop that
//! drives it:
//!
//! - [`state`] - Job states and legal transitions
//! - [`guard`] - Per-job variant mutual exclusion
//! - [`points`] - Baseline reconciliation across variants
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │AccountPipeline│───>│JobStateMachine│───>│ Reconciliation│
//! └──────────────┘     └──────────────┘     └──────────────┘
//!       │                    │                    │
//!       v                    v                    v
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ TaskExecutor │     │  Classifier  │     │GlobalStandby │
//! │ + RetryPolicy│     │  + Throttle  │     │  + AlertSink │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! Jobs run strictly one after another. The only concurrency inside a
//! pipeline is the two task variants in [`ExecutionMode::Parallel`], joined
//! before classification. Executor errors and panics never leave the
//! pipeline; only a defect in the batch loop itself returns `Err`.

pub mod guard;
pub mod points;
pub mod state;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::ValueEnum;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::classify::FailureClass;
use crate::error::Result;
use crate::interfaces::{AlertSink, ExecutionContext, FailureClassifier, TaskExecutor};
use crate::job::{Job, ResultSummary, TaskOutcome, Variant};
use crate::ledger::JobLedger;
use crate::notify::deliver_alert;
use crate::retry::{RetryError, RetryPolicy};
use crate::standby::GlobalStandby;
use crate::throttle::{AdaptiveThrottle, DelayRange};

pub use guard::VariantGuard;
pub use points::{reconcile, Reconciliation};
pub use state::{JobState, JobStateMachine};

// ============================================================================
// Configuration
// ============================================================================

/// How the two task variants of a job are executed.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Both variants run concurrently, each isolated from the other.
    Parallel,
    /// Variants run one after another behind a per-job guard.
    Sequential,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: ExecutionMode,
    /// Run the primary variant.
    pub primary: bool,
    /// Run the secondary variant.
    pub secondary: bool,
    /// Wait before touching an account (scaled by the throttle).
    pub pre_delay: DelayRange,
    /// Wait after every job regardless of outcome (scaled by the throttle).
    pub post_delay: DelayRange,
    /// Retry policy wrapped around every executor call.
    pub retry: RetryPolicy,
    /// Run the single end-of-batch retry pass for login failures.
    pub retry_failed_logins: bool,
    /// Baseline spread above which reconciliation logs a warning.
    pub baseline_warn_threshold: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            primary: true,
            secondary: true,
            pre_delay: DelayRange::new(5_000, 15_000),
            post_delay: DelayRange::new(10_000, 30_000),
            retry: RetryPolicy::default(),
            retry_failed_logins: true,
            baseline_warn_threshold: 100,
        }
    }
}

impl PipelineConfig {
    /// Variants enabled by this configuration, in execution order.
    #[must_use]
    pub fn variants(&self) -> Vec<Variant> {
        Variant::ALL
            .into_iter()
            .filter(|v| match v {
                Variant::Primary => self.primary,
                Variant::Secondary => self.secondary,
            })
            .collect()
    }
}

// ============================================================================
// Batch results
// ============================================================================

/// Cooperative stop request, set when a termination signal is relayed.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// An unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the batch to stop after the in-flight job.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the batch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every job (and the retry pass) ran.
    Completed,
    /// Global Standby halted the batch.
    Standby,
    /// A stop request ended the batch early.
    Stopped,
}

/// Outcome of one job attempt as seen by the batch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobVerdict {
    Clean,
    Transient,
    Login,
    Halt(FailureClass),
}

/// Result of one variant's execution.
struct VariantRun {
    variant: Variant,
    result: std::result::Result<TaskOutcome, anyhow::Error>,
    class: Option<FailureClass>,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Runs a batch of jobs through the per-job state machine.
pub struct AccountPipeline {
    config: PipelineConfig,
    executor: Arc<dyn TaskExecutor>,
    classifier: Arc<dyn FailureClassifier>,
    alerts: Arc<dyn AlertSink>,
    throttle: Arc<AdaptiveThrottle>,
    ledger: JobLedger,
    standby: GlobalStandby,
    stop: StopFlag,
    date_key: String,
    summaries: Vec<ResultSummary>,
    retried: Vec<String>,
    unprocessed: Vec<String>,
}

impl AccountPipeline {
    /// Create a pipeline. The throttle defaults to [`AdaptiveThrottle::default`],
    /// the date key to today's.
    pub fn new(
        config: PipelineConfig,
        executor: Arc<dyn TaskExecutor>,
        classifier: Arc<dyn FailureClassifier>,
        alerts: Arc<dyn AlertSink>,
        ledger: JobLedger,
        standby: GlobalStandby,
    ) -> Self {
        Self {
            config,
            executor,
            classifier,
            alerts,
            throttle: Arc::new(AdaptiveThrottle::default()),
            ledger,
            standby,
            stop: StopFlag::new(),
            date_key: JobLedger::today(),
            summaries: Vec::new(),
            retried: Vec::new(),
            unprocessed: Vec::new(),
        }
    }

    /// Use a shared throttle.
    #[must_use]
    pub fn with_throttle(mut self, throttle: Arc<AdaptiveThrottle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Observe an external stop request.
    #[must_use]
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Pin the ledger day (the run's start day by default).
    #[must_use]
    pub fn with_date_key(mut self, date_key: impl Into<String>) -> Self {
        self.date_key = date_key.into();
        self
    }

    /// Summaries recorded so far, one per job.
    #[must_use]
    pub fn summaries(&self) -> &[ResultSummary] {
        &self.summaries
    }

    /// Hand over the recorded summaries, leaving the pipeline empty.
    pub fn take_summaries(&mut self) -> Vec<ResultSummary> {
        std::mem::take(&mut self.summaries)
    }

    /// Ids of the jobs that went through the end-of-batch retry pass.
    #[must_use]
    pub fn retried_jobs(&self) -> &[String] {
        &self.retried
    }

    /// Ids of the jobs left untouched because the batch stopped early,
    /// including login failures whose retry never ran.
    #[must_use]
    pub fn unprocessed_jobs(&self) -> &[String] {
        &self.unprocessed
    }

    /// Shared throttle handle.
    #[must_use]
    pub fn throttle(&self) -> &Arc<AdaptiveThrottle> {
        &self.throttle
    }

    /// Run `jobs` in order, then retry every login failure exactly once.
    ///
    /// # Errors
    ///
    /// Only batch-loop defects (such as an illegal state transition) are
    /// returned; executor failures are recorded in the summaries.
    pub async fn run_batch(&mut self, jobs: Vec<Job>) -> Result<BatchOutcome> {
        let total = jobs.len();
        let mut jobs = jobs;
        let mut retry_queue: Vec<Job> = Vec::new();

        for index in 0..total {
            if let Some(outcome) = self.halt_reason(&jobs[index].id) {
                self.leave_unprocessed(&jobs[index..]);
                return Ok(outcome);
            }

            info!("Job {}/{}: {}", index + 1, total, jobs[index].id);
            self.process_job(&mut jobs[index]).await?;

            let job = &mut jobs[index];
            if job.do_later {
                if self.config.retry_failed_logins {
                    info!("Job {} queued for the end-of-batch retry", job.id);
                    let mut queued = job.clone();
                    queued.do_later = false;
                    retry_queue.push(queued);
                } else {
                    warn!("Job {} failed to log in; retry pass disabled", job.id);
                }
                job.do_later = false;
            }
        }

        if !retry_queue.is_empty() {
            info!("Retry pass: {} job(s)", retry_queue.len());
        }

        let queued = retry_queue.len();
        for index in 0..queued {
            // Queued jobs already have a first-pass summary
            if let Some(outcome) = self.halt_reason(&retry_queue[index].id) {
                self.leave_unprocessed(&retry_queue[index..]);
                return Ok(outcome);
            }

            let job = &mut retry_queue[index];
            self.retried.push(job.id.clone());
            info!("Retrying job {}", job.id);
            self.process_job(job).await?;

            let job = &mut retry_queue[index];
            if job.do_later {
                warn!(
                    "Job {} failed to log in again; no further automatic retry",
                    job.id
                );
                job.do_later = false;
            }
        }

        Ok(BatchOutcome::Completed)
    }

    fn halt_reason(&self, next_job: &str) -> Option<BatchOutcome> {
        if self.standby.is_active() {
            warn!(
                "Global standby active ({}); not starting job {} or any later job",
                self.standby.reason().unwrap_or_default(),
                next_job
            );
            return Some(BatchOutcome::Standby);
        }
        if self.stop.is_requested() {
            info!("Stop requested; not starting job {}", next_job);
            return Some(BatchOutcome::Stopped);
        }
        None
    }

    fn leave_unprocessed(&mut self, remaining: &[Job]) {
        self.unprocessed
            .extend(remaining.iter().map(|job| job.id.clone()));
    }

    /// Drive one job through the state machine and record its summary.
    async fn process_job(&mut self, job: &mut Job) -> Result<()> {
        let started = Instant::now();
        job.clear_transient_flags();
        let mut machine = JobStateMachine::new(&job.id);
        let mut summary = ResultSummary::new(&job.id);

        machine.advance(JobState::PreDelay)?;
        self.wait(self.config.pre_delay).await;

        machine.advance(JobState::Executing)?;
        let runs = match self.config.mode {
            ExecutionMode::Parallel => self.execute_parallel(job).await,
            ExecutionMode::Sequential => self.execute_sequential(job).await,
        };

        machine.advance(JobState::Classifying)?;
        let verdict = self.classify(job, &runs, &mut summary);
        summary.compromised = job.compromised;
        self.throttle.record(verdict == JobVerdict::Clean);

        let outcomes: Vec<(Variant, TaskOutcome)> = runs
            .into_iter()
            .filter_map(|run| run.result.ok().map(|outcome| (run.variant, outcome)))
            .collect();
        self.apply_points(job, &outcomes, &mut summary);

        match verdict {
            JobVerdict::Halt(class) => {
                machine.advance(JobState::GlobalStandby)?;
                summary.banned = class.verdict();
                self.escalate(job, &class).await;
            }
            JobVerdict::Login => {
                machine.advance(JobState::RetryQueued)?;
                job.do_later = true;
                machine.advance(JobState::PostDelay)?;
                self.wait(self.config.post_delay).await;
                machine.advance(JobState::Recorded)?;
            }
            JobVerdict::Clean | JobVerdict::Transient => {
                machine.advance(JobState::PostDelay)?;
                self.wait(self.config.post_delay).await;
                machine.advance(JobState::Recorded)?;
            }
        }

        summary.duration = started.elapsed();
        info!(
            "Job {} finished in {:.1}s: +{} points, {} error(s)",
            job.id,
            summary.duration.as_secs_f64(),
            summary.total_collected,
            summary.errors.len()
        );
        self.record(summary);
        Ok(())
    }

    async fn execute_parallel(&self, job: &Job) -> Vec<VariantRun> {
        let variants = self.config.variants();
        join_all(variants.into_iter().map(|v| self.execute_variant(job, v))).await
    }

    /// Variants of one job never overlap; the guard enforces it regardless
    /// of how this loop schedules them.
    async fn execute_sequential(&self, job: &Job) -> Vec<VariantRun> {
        let guard = VariantGuard::new();
        let mut runs = Vec::new();

        for variant in self.config.variants() {
            let Some(run) = self.execute_guarded(&guard, job, variant).await else {
                continue;
            };

            let halt = run.class.as_ref().is_some_and(FailureClass::is_ban_like);
            runs.push(run);
            if halt {
                warn!(
                    "Job {}: {} classified as ban/compromise, skipping remaining variants",
                    job.id, variant
                );
                break;
            }
        }
        runs
    }

    /// Run `variant` only if no other variant of the job holds `guard`.
    async fn execute_guarded(
        &self,
        guard: &VariantGuard,
        job: &Job,
        variant: Variant,
    ) -> Option<VariantRun> {
        let Some(_permit) = guard.try_enter() else {
            warn!(
                "Job {}: another variant is still running, skipping {}",
                job.id, variant
            );
            return None;
        };
        Some(self.execute_variant(job, variant).await)
    }

    /// Execute one variant under the retry policy, isolating errors and panics.
    /// No further attempt starts once a stop has been requested.
    async fn execute_variant(&self, job: &Job, variant: Variant) -> VariantRun {
        let base = ExecutionContext {
            job: job.clone(),
            variant,
            attempt: 0,
            date_key: self.date_key.clone(),
            account_key: JobLedger::account_key(&job.account),
            ledger: self.ledger.clone(),
        };

        let attempts = self.config.retry.run_while(
            |attempt| {
                let executor = self.executor.clone();
                let ctx = ExecutionContext {
                    attempt,
                    ..base.clone()
                };
                async move { executor.execute(&ctx).await }
            },
            |_| true,
            |e| !self.stop.is_requested() && self.classifier.classify(e).is_retryable(),
        );

        // Classified before wrapping so ban reasons keep the executor's wording
        let (result, class) = match AssertUnwindSafe(attempts).catch_unwind().await {
            Ok(Ok(outcome)) => (Ok(outcome), None),
            Ok(Err(RetryError::Failed { attempts, error })) => {
                let class = self.classifier.classify(&error);
                let error = error.context(format!("{variant} failed after {attempts} attempt(s)"));
                (Err(error), Some(class))
            }
            Ok(Err(RetryError::Rejected { attempts, .. })) => {
                let error =
                    anyhow::anyhow!("{variant} result rejected after {attempts} attempt(s)");
                let class = self.classifier.classify(&error);
                (Err(error), Some(class))
            }
            Err(panic) => {
                let error = anyhow::anyhow!(
                    "{variant} task panicked: {}",
                    panic_message(panic.as_ref())
                );
                let class = self.classifier.classify(&error);
                (Err(error), Some(class))
            }
        };

        if let Ok(outcome) = &result {
            if !outcome.completed_units.is_empty() {
                if let Err(e) =
                    self.ledger
                        .mark_all(&base.account_key, &base.date_key, &outcome.completed_units)
                {
                    warn!("Job {}: failed to update ledger: {}", job.id, e);
                }
            }
        }

        VariantRun {
            variant,
            result,
            class,
        }
    }

    /// Fold the variant runs into one verdict, recording every error.
    fn classify(&self, job: &mut Job, runs: &[VariantRun], summary: &mut ResultSummary) -> JobVerdict {
        let mut verdict = JobVerdict::Clean;

        for run in runs {
            let (Err(error), Some(class)) = (&run.result, &run.class) else {
                continue;
            };
            summary.errors.push(format!("{}: {:#}", run.variant, error));

            match class {
                FailureClass::Banned { .. } | FailureClass::Compromised { .. } => {
                    error!("Job {} [{}]: {}", job.id, run.variant, class);
                    if matches!(class, FailureClass::Compromised { .. }) {
                        job.compromised = true;
                    }
                    if !matches!(verdict, JobVerdict::Halt(_)) {
                        verdict = JobVerdict::Halt(class.clone());
                    }
                }
                FailureClass::LoginFailure => {
                    warn!("Job {} [{}]: login failure: {:#}", job.id, run.variant, error);
                    if matches!(verdict, JobVerdict::Clean | JobVerdict::Transient) {
                        verdict = JobVerdict::Login;
                    }
                }
                FailureClass::Transient => {
                    warn!("Job {} [{}]: {:#}", job.id, run.variant, error);
                    if verdict == JobVerdict::Clean {
                        verdict = JobVerdict::Transient;
                    }
                }
            }
        }
        verdict
    }

    fn apply_points(&self, job: &Job, outcomes: &[(Variant, TaskOutcome)], summary: &mut ResultSummary) {
        let totals = reconcile(outcomes);
        if totals.baseline_discrepancy > self.config.baseline_warn_threshold {
            warn!(
                "Job {}: variants disagree on the starting balance by {} points; using the lower value {}",
                job.id, totals.baseline_discrepancy, totals.initial_total
            );
        }
        summary.initial_total = totals.initial_total;
        summary.total_collected = totals.total_collected;
        summary.points = totals.points;
    }

    async fn escalate(&self, job: &Job, class: &FailureClass) {
        let reason = class.verdict().reason;
        if self.standby.activate(format!("job {}: {}", job.id, reason)) {
            error!(
                "GLOBAL STANDBY activated by job {} ({}); no further jobs will start in this process",
                job.id, reason
            );
        } else {
            warn!("Job {}: {} while already in global standby", job.id, class);
        }

        let title = format!("{} on job {}", class.description(), job.id);
        let body = format!(
            "Job: {}\nAccount: {}\nReason: {}\nFurther jobs in this worker are halted until manual review.",
            job.id, job.account, reason
        );
        deliver_alert(self.alerts.as_ref(), &title, &body).await;
    }

    fn record(&mut self, summary: ResultSummary) {
        match self
            .summaries
            .iter_mut()
            .find(|existing| existing.job_id == summary.job_id)
        {
            Some(existing) => *existing = summary,
            None => self.summaries.push(summary),
        }
    }

    async fn wait(&self, range: DelayRange) {
        let range = self.throttle.scale(range);
        if range.is_zero() {
            return;
        }
        let delay = range.sample();
        debug!("Waiting {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::PatternClassifier;
    use crate::testing::{CapturedLogs, MockAlertSink, MockExecutor};
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    /// Fails transiently and requests a stop on every call.
    struct StoppingExecutor {
        stop: StopFlag,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl TaskExecutor for StoppingExecutor {
        async fn execute(&self, _ctx: &ExecutionContext) -> anyhow::Result<TaskOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.stop.request();
            anyhow::bail!("connection reset by peer")
        }
    }

    struct Harness {
        pipeline: AccountPipeline,
        alerts: Arc<MockAlertSink>,
        standby: GlobalStandby,
        _temp_dir: TempDir,
    }

    fn instant_config(mode: ExecutionMode) -> PipelineConfig {
        PipelineConfig {
            mode,
            pre_delay: DelayRange::ZERO,
            post_delay: DelayRange::ZERO,
            retry: RetryPolicy::new(2, 0),
            ..PipelineConfig::default()
        }
    }

    fn harness(config: PipelineConfig, executor: Arc<dyn TaskExecutor>) -> Harness {
        let temp_dir = TempDir::new().expect("temp dir");
        let alerts = Arc::new(MockAlertSink::new());
        let standby = GlobalStandby::new();
        let pipeline = AccountPipeline::new(
            config,
            executor,
            Arc::new(PatternClassifier::default()),
            alerts.clone(),
            JobLedger::new(temp_dir.path().join("ledger")),
            standby.clone(),
        )
        .with_date_key("2026-10-18");
        Harness {
            pipeline,
            alerts,
            standby,
            _temp_dir: temp_dir,
        }
    }

    fn jobs(ids: &[&str]) -> Vec<Job> {
        ids.iter().map(|id| Job::new(*id, format!("{id}@example.com"))).collect()
    }

    // =========================================================================
    // Points
    // =========================================================================

    #[tokio::test]
    async fn test_parallel_variants_reconcile_points() {
        let executor = Arc::new(
            MockExecutor::new()
                .with_outcome("a", Variant::Primary, TaskOutcome::new(100, 5))
                .with_outcome("a", Variant::Secondary, TaskOutcome::new(100, 7)),
        );
        let mut h = harness(instant_config(ExecutionMode::Parallel), executor);

        let outcome = h.pipeline.run_batch(jobs(&["a"])).await.expect("batch");

        assert_eq!(outcome, BatchOutcome::Completed);
        let summary = &h.pipeline.summaries()[0];
        assert_eq!(summary.initial_total, 100);
        assert_eq!(summary.total_collected, 12);
        assert!(summary.errors.is_empty());
    }

    // =========================================================================
    // Isolation
    // =========================================================================

    #[tokio::test]
    async fn test_parallel_failure_does_not_abort_other_variant() {
        let executor = Arc::new(
            MockExecutor::new()
                .with_error("a", Variant::Primary, "page timed out")
                .with_outcome("a", Variant::Secondary, TaskOutcome::new(50, 3)),
        );
        let mut h = harness(instant_config(ExecutionMode::Parallel), executor.clone());

        h.pipeline.run_batch(jobs(&["a"])).await.expect("batch");

        let summary = &h.pipeline.summaries()[0];
        assert_eq!(summary.total_collected, 3);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].starts_with("primary"));
        // Transient error retried up to max_attempts
        assert_eq!(executor.calls_for("a", Variant::Primary), 2);
        assert_eq!(executor.calls_for("a", Variant::Secondary), 1);
    }

    #[tokio::test]
    async fn test_panicking_variant_is_captured() {
        let executor = Arc::new(
            MockExecutor::new()
                .with_panic("a", Variant::Primary)
                .with_outcome("a", Variant::Secondary, TaskOutcome::new(10, 1)),
        );
        let mut config = instant_config(ExecutionMode::Parallel);
        config.retry = RetryPolicy::new(1, 0);
        let mut h = harness(config, executor);

        let outcome = h.pipeline.run_batch(jobs(&["a", "b"])).await.expect("batch");

        assert_eq!(outcome, BatchOutcome::Completed);
        assert_eq!(h.pipeline.summaries().len(), 2);
        assert!(h.pipeline.summaries()[0].errors[0].contains("panicked"));
    }

    // =========================================================================
    // Standby
    // =========================================================================

    #[tokio::test]
    async fn test_ban_halts_batch_and_alerts_once() {
        let executor = Arc::new(
            MockExecutor::new().with_error("b", Variant::Primary, "Account has been suspended"),
        );
        let mut h = harness(instant_config(ExecutionMode::Parallel), executor.clone());

        let outcome = h
            .pipeline
            .run_batch(jobs(&["a", "b", "c", "d"]))
            .await
            .expect("batch");

        assert_eq!(outcome, BatchOutcome::Standby);
        assert!(h.standby.is_active());
        assert_eq!(executor.calls_for_job("c"), 0);
        assert_eq!(executor.calls_for_job("d"), 0);
        assert_eq!(h.pipeline.unprocessed_jobs(), ["c", "d"]);

        // Ban errors are not retried
        assert_eq!(executor.calls_for("b", Variant::Primary), 1);

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].0.contains('b'));
        assert!(alerts[0].1.contains("Account has been suspended"));

        let banned = &h.pipeline.summaries()[1];
        assert!(banned.banned.status);
        assert_eq!(banned.banned.reason, "Account has been suspended");
    }

    #[tokio::test]
    async fn test_active_standby_prevents_any_execution() {
        let executor = Arc::new(MockExecutor::new());
        let mut h = harness(instant_config(ExecutionMode::Sequential), executor.clone());
        h.standby.activate("set by operator");

        let outcome = h.pipeline.run_batch(jobs(&["a", "b"])).await.expect("batch");

        assert_eq!(outcome, BatchOutcome::Standby);
        assert_eq!(executor.total_calls(), 0);
        assert!(h.pipeline.summaries().is_empty());
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_sequential_skips_second_variant_after_ban() {
        let executor = Arc::new(
            MockExecutor::new().with_error("a", Variant::Primary, "account banned: abuse"),
        );
        let mut h = harness(instant_config(ExecutionMode::Sequential), executor.clone());

        h.pipeline.run_batch(jobs(&["a"])).await.expect("batch");

        assert_eq!(executor.calls_for("a", Variant::Secondary), 0);
        assert!(h.pipeline.summaries()[0].banned.status);
    }

    #[tokio::test]
    async fn test_compromise_sets_flag_and_standby() {
        let executor = Arc::new(MockExecutor::new().with_error(
            "a",
            Variant::Secondary,
            "security challenge required",
        ));
        let mut h = harness(instant_config(ExecutionMode::Parallel), executor);

        let outcome = h.pipeline.run_batch(jobs(&["a", "b"])).await.expect("batch");

        assert_eq!(outcome, BatchOutcome::Standby);
        assert!(h
            .standby
            .reason()
            .expect("reason")
            .contains("security challenge required"));
        let summary = &h.pipeline.summaries()[0];
        assert!(summary.compromised);
        assert!(summary.banned.status);
    }

    #[tokio::test]
    async fn test_ban_is_not_reported_as_compromise() {
        let executor = Arc::new(
            MockExecutor::new().with_error("a", Variant::Primary, "Account has been suspended"),
        );
        let mut h = harness(instant_config(ExecutionMode::Parallel), executor);

        h.pipeline.run_batch(jobs(&["a"])).await.expect("batch");

        let summary = &h.pipeline.summaries()[0];
        assert!(summary.banned.status);
        assert!(!summary.compromised);
    }

    // =========================================================================
    // Login retry pass
    // =========================================================================

    #[tokio::test]
    async fn test_login_failure_retried_exactly_once() {
        let executor = Arc::new(
            MockExecutor::new().with_error("b", Variant::Primary, "Login failed: bad password"),
        );
        let mut h = harness(instant_config(ExecutionMode::Sequential), executor.clone());

        let outcome = h
            .pipeline
            .run_batch(jobs(&["a", "b", "c"]))
            .await
            .expect("batch");

        assert_eq!(outcome, BatchOutcome::Completed);
        assert_eq!(h.pipeline.retried_jobs(), ["b"]);
        // Pass 1 + retry pass; login failures are not retried by the policy
        assert_eq!(executor.calls_for("b", Variant::Primary), 2);
        // Retry summary replaces the first one
        assert_eq!(h.pipeline.summaries().len(), 3);
        assert!(!h.standby.is_active());
    }

    #[tokio::test]
    async fn test_login_recovered_on_retry() {
        let executor = Arc::new(
            MockExecutor::new()
                .with_error_times("a", Variant::Primary, "sign-in failed", 1)
                .with_outcome("a", Variant::Primary, TaskOutcome::new(10, 4)),
        );
        let mut config = instant_config(ExecutionMode::Sequential);
        config.secondary = false;
        let mut h = harness(config, executor);

        h.pipeline.run_batch(jobs(&["a"])).await.expect("batch");

        assert_eq!(h.pipeline.retried_jobs(), ["a"]);
        let summary = &h.pipeline.summaries()[0];
        assert!(summary.errors.is_empty());
        assert_eq!(summary.total_collected, 4);
    }

    #[tokio::test]
    async fn test_retry_pass_disabled() {
        let executor =
            Arc::new(MockExecutor::new().with_error("a", Variant::Primary, "login failed"));
        let mut config = instant_config(ExecutionMode::Parallel);
        config.retry_failed_logins = false;
        let mut h = harness(config, executor.clone());

        h.pipeline.run_batch(jobs(&["a"])).await.expect("batch");

        assert!(h.pipeline.retried_jobs().is_empty());
        assert_eq!(executor.calls_for("a", Variant::Primary), 1);
    }

    // =========================================================================
    // Stop, throttle and ledger
    // =========================================================================

    #[tokio::test]
    async fn test_stop_flag_ends_batch_before_next_job() {
        let executor = Arc::new(MockExecutor::new());
        let stop = StopFlag::new();
        let h = harness(instant_config(ExecutionMode::Parallel), executor.clone());
        let mut pipeline = h.pipeline.with_stop_flag(stop.clone());
        stop.request();

        let outcome = pipeline.run_batch(jobs(&["a", "b"])).await.expect("batch");

        assert_eq!(outcome, BatchOutcome::Stopped);
        assert_eq!(executor.total_calls(), 0);
        assert_eq!(pipeline.unprocessed_jobs(), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_failures_feed_throttle() {
        let executor = Arc::new(
            MockExecutor::new()
                .with_error("a", Variant::Primary, "timeout")
                .with_error("b", Variant::Primary, "timeout"),
        );
        let mut h = harness(instant_config(ExecutionMode::Parallel), executor);

        h.pipeline
            .run_batch(jobs(&["a", "b", "c"]))
            .await
            .expect("batch");

        assert_eq!(h.pipeline.throttle().len(), 3);
        assert!(h.pipeline.throttle().delay_multiplier() > 1.0);
    }

    #[tokio::test]
    async fn test_completed_units_marked_in_ledger() {
        let mut outcome = TaskOutcome::new(0, 1);
        outcome.completed_units = vec!["daily-set".into()];
        let executor =
            Arc::new(MockExecutor::new().with_outcome("a", Variant::Primary, outcome));
        let mut h = harness(instant_config(ExecutionMode::Parallel), executor);

        h.pipeline.run_batch(jobs(&["a"])).await.expect("batch");

        let key = JobLedger::account_key("a@example.com");
        assert!(h
            .pipeline
            .ledger
            .is_done(&key, "2026-10-18", "daily-set")
            .expect("read"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_are_applied() {
        let executor = Arc::new(MockExecutor::new());
        let mut config = instant_config(ExecutionMode::Parallel);
        config.pre_delay = DelayRange::new(1_000, 1_000);
        config.post_delay = DelayRange::new(2_000, 2_000);
        let mut h = harness(config, executor);
        let start = tokio::time::Instant::now();

        h.pipeline.run_batch(jobs(&["a"])).await.expect("batch");

        assert!(start.elapsed() >= std::time::Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn test_standby_before_retry_pass_leaves_queued_jobs_unprocessed() {
        let executor = Arc::new(
            MockExecutor::new()
                .with_error("a", Variant::Primary, "Login failed: bad password")
                .with_error("b", Variant::Primary, "Account has been suspended"),
        );
        let mut h = harness(instant_config(ExecutionMode::Sequential), executor.clone());

        let outcome = h.pipeline.run_batch(jobs(&["a", "b"])).await.expect("batch");

        assert_eq!(outcome, BatchOutcome::Standby);
        assert!(h.pipeline.retried_jobs().is_empty());
        assert_eq!(h.pipeline.unprocessed_jobs(), ["a"]);
        assert_eq!(executor.calls_for("a", Variant::Primary), 1);
    }

    #[tokio::test]
    async fn test_stop_request_ends_retries_of_in_flight_job() {
        let stop = StopFlag::new();
        let executor = Arc::new(StoppingExecutor {
            stop: stop.clone(),
            calls: AtomicU32::new(0),
        });
        let mut config = instant_config(ExecutionMode::Sequential);
        config.secondary = false;
        config.retry = RetryPolicy::new(3, 0);
        let h = harness(config, executor.clone());
        let mut pipeline = h.pipeline.with_stop_flag(stop);

        let outcome = pipeline.run_batch(jobs(&["a", "b"])).await.expect("batch");

        assert_eq!(outcome, BatchOutcome::Stopped);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.summaries().len(), 1);
        assert_eq!(pipeline.unprocessed_jobs(), ["b"]);
    }

    #[tokio::test]
    async fn test_baseline_discrepancy_warning_respects_threshold() {
        let outcomes = |job: &str, executor: MockExecutor| {
            executor
                .with_outcome(job, Variant::Primary, TaskOutcome::new(90, 1))
                .with_outcome(job, Variant::Secondary, TaskOutcome::new(300, 2))
        };
        let logs = CapturedLogs::new();
        let _guard = logs.install();

        let executor = Arc::new(outcomes("wide", MockExecutor::new()));
        let mut h = harness(instant_config(ExecutionMode::Parallel), executor);
        h.pipeline.run_batch(jobs(&["wide"])).await.expect("batch");

        assert_eq!(h.pipeline.summaries()[0].initial_total, 90);
        assert!(logs.contains("Job wide: variants disagree on the starting balance by 210 points"));

        let mut config = instant_config(ExecutionMode::Parallel);
        config.baseline_warn_threshold = 500;
        let executor = Arc::new(outcomes("tolerated", MockExecutor::new()));
        let mut h = harness(config, executor);
        h.pipeline.run_batch(jobs(&["tolerated"])).await.expect("batch");

        assert_eq!(h.pipeline.summaries()[0].initial_total, 90);
        assert!(!logs.contains("Job tolerated: variants disagree"));
    }

    #[tokio::test]
    async fn test_guarded_variant_skipped_while_guard_held() {
        let executor = Arc::new(MockExecutor::new());
        let h = harness(instant_config(ExecutionMode::Sequential), executor.clone());
        let job = Job::new("a", "a@example.com");
        let guard = VariantGuard::new();

        let held = guard.try_enter().expect("permit");
        let skipped = h
            .pipeline
            .execute_guarded(&guard, &job, Variant::Secondary)
            .await;
        assert!(skipped.is_none());
        assert_eq!(executor.total_calls(), 0);

        drop(held);
        let run = h
            .pipeline
            .execute_guarded(&guard, &job, Variant::Secondary)
            .await
            .expect("run");
        assert!(run.result.is_ok());
        assert!(!guard.is_busy());
        assert_eq!(executor.calls_for("a", Variant::Secondary), 1);
    }

    #[test]
    fn test_config_variants() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.variants(), vec![Variant::Primary, Variant::Secondary]);
        config.primary = false;
        assert_eq!(config.variants(), vec![Variant::Secondary]);
    }
}
