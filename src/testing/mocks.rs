//! Mock implementations of the collaborator traits.
//!
//! These mocks provide controllable test doubles for the executor, the
//! notification sinks and the job source, enabling deterministic tests of
//! the pipeline, worker and supervisor.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::interfaces::{AlertSink, ConclusionSink, ExecutionContext, JobSource, TaskExecutor};
use crate::job::{Job, ResultSummary, TaskOutcome, Variant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted behaviour for one `(job, variant)` pair.
#[derive(Debug, Clone, Default)]
struct Script {
    error: Option<String>,
    /// `None` fails forever, `Some(n)` fails the next `n` calls.
    errors_left: Option<u32>,
    panic: bool,
    outcome: Option<TaskOutcome>,
}

/// Mock task executor with per-job, per-variant scripts.
///
/// Unscripted calls succeed with an empty [`TaskOutcome`].
///
/// # Example
///
/// ```rust,ignore
/// let executor = MockExecutor::new()
///     .with_outcome("a", Variant::Primary, TaskOutcome::new(100, 5))
///     .with_error("b", Variant::Secondary, "Account has been suspended");
///
/// assert_eq!(executor.calls_for("a", Variant::Primary), 0);
/// ```
#[derive(Debug, Default)]
pub struct MockExecutor {
    scripts: Mutex<HashMap<(String, Variant), Script>>,
    calls: Mutex<HashMap<(String, Variant), u32>>,
    total: AtomicU32,
}

impl MockExecutor {
    /// Create a mock where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(self, job_id: &str, variant: Variant, edit: impl FnOnce(&mut Script)) -> Self {
        edit(
            lock(&self.scripts)
                .entry((job_id.to_string(), variant))
                .or_default(),
        );
        self
    }

    /// Return `outcome` once any scripted errors are used up.
    #[must_use]
    pub fn with_outcome(self, job_id: &str, variant: Variant, outcome: TaskOutcome) -> Self {
        self.script(job_id, variant, |s| s.outcome = Some(outcome))
    }

    /// Fail every call with `message`.
    #[must_use]
    pub fn with_error(self, job_id: &str, variant: Variant, message: &str) -> Self {
        self.script(job_id, variant, |s| {
            s.error = Some(message.to_string());
            s.errors_left = None;
        })
    }

    /// Fail the next `times` calls with `message`, then succeed.
    #[must_use]
    pub fn with_error_times(self, job_id: &str, variant: Variant, message: &str, times: u32) -> Self {
        self.script(job_id, variant, |s| {
            s.error = Some(message.to_string());
            s.errors_left = Some(times);
        })
    }

    /// Panic inside the executor.
    #[must_use]
    pub fn with_panic(self, job_id: &str, variant: Variant) -> Self {
        self.script(job_id, variant, |s| s.panic = true)
    }

    /// Calls made for one job and variant.
    #[must_use]
    pub fn calls_for(&self, job_id: &str, variant: Variant) -> u32 {
        lock(&self.calls)
            .get(&(job_id.to_string(), variant))
            .copied()
            .unwrap_or(0)
    }

    /// Calls made for a job across both variants.
    #[must_use]
    pub fn calls_for_job(&self, job_id: &str) -> u32 {
        Variant::ALL
            .into_iter()
            .map(|variant| self.calls_for(job_id, variant))
            .sum()
    }

    /// Calls made in total.
    #[must_use]
    pub fn total_calls(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<TaskOutcome> {
        let key = (ctx.job.id.clone(), ctx.variant);
        self.total.fetch_add(1, Ordering::SeqCst);
        *lock(&self.calls).entry(key.clone()).or_insert(0) += 1;

        let scripted = {
            let mut scripts = lock(&self.scripts);
            let Some(script) = scripts.get_mut(&key) else {
                return Ok(TaskOutcome::default());
            };
            if script.panic {
                None
            } else {
                match (&script.error, script.errors_left) {
                    (Some(message), None) => Some(Err(message.clone())),
                    (Some(message), Some(left)) if left > 0 => {
                        script.errors_left = Some(left - 1);
                        Some(Err(message.clone()))
                    }
                    _ => Some(Ok(script.outcome.clone().unwrap_or_default())),
                }
            }
        };

        match scripted {
            None => panic!("mock executor panic for job {}", ctx.job.id),
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => bail!("{}", message),
        }
    }
}

/// Mock alert sink recording every alert it receives.
#[derive(Debug, Default)]
pub struct MockAlertSink {
    alerts: Mutex<Vec<(String, String)>>,
    error: Option<String>,
}

impl MockAlertSink {
    /// Create a sink that accepts every alert.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record alerts but report a delivery failure.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// `(title, body)` of every alert received.
    #[must_use]
    pub fn alerts(&self) -> Vec<(String, String)> {
        lock(&self.alerts).clone()
    }
}

#[async_trait]
impl AlertSink for MockAlertSink {
    async fn send_alert(&self, title: &str, body: &str) -> Result<()> {
        lock(&self.alerts).push((title.to_string(), body.to_string()));
        match &self.error {
            Some(error) => bail!("{}", error),
            None => Ok(()),
        }
    }
}

/// Shared log of the conclusions a [`MockConclusionSink`] received.
pub type ConclusionLog = Arc<Mutex<Vec<Vec<ResultSummary>>>>;

/// Mock conclusion sink recording every delivery.
#[derive(Debug, Default)]
pub struct MockConclusionSink {
    received: ConclusionLog,
    error: Option<String>,
}

impl MockConclusionSink {
    /// Create a sink that accepts every conclusion.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record conclusions but report a delivery failure.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Handle that stays valid after the sink is moved into a fan-out.
    #[must_use]
    pub fn handle(&self) -> ConclusionLog {
        Arc::clone(&self.received)
    }
}

#[async_trait]
impl ConclusionSink for MockConclusionSink {
    async fn send_conclusion(&self, summaries: &[ResultSummary]) -> Result<()> {
        lock(&self.received).push(summaries.to_vec());
        match &self.error {
            Some(error) => bail!("{}", error),
            None => Ok(()),
        }
    }
}

/// Mock job source returning a fixed list.
#[derive(Debug, Clone, Default)]
pub struct MockJobSource {
    jobs: Vec<Job>,
    error: Option<String>,
}

impl MockJobSource {
    /// Source returning `jobs`.
    #[must_use]
    pub fn new(jobs: Vec<Job>) -> Self {
        Self { jobs, error: None }
    }

    /// Fail to load.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

impl JobSource for MockJobSource {
    fn load_jobs(&self) -> Result<Vec<Job>> {
        match &self.error {
            Some(error) => bail!("{}", error),
            None => Ok(self.jobs.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::JobLedger;

    fn context(job_id: &str, variant: Variant) -> ExecutionContext {
        ExecutionContext {
            job: Job::new(job_id, "a@example.com"),
            variant,
            attempt: 1,
            date_key: "2026-10-18".into(),
            account_key: "key".into(),
            ledger: JobLedger::new("/nonexistent"),
        }
    }

    #[tokio::test]
    async fn test_mock_executor_error_times() {
        let executor = MockExecutor::new().with_error_times("a", Variant::Primary, "timeout", 1);

        assert!(executor.execute(&context("a", Variant::Primary)).await.is_err());
        assert!(executor.execute(&context("a", Variant::Primary)).await.is_ok());
        assert!(executor.execute(&context("a", Variant::Secondary)).await.is_ok());
        assert_eq!(executor.calls_for("a", Variant::Primary), 2);
        assert_eq!(executor.calls_for_job("a"), 3);
        assert_eq!(executor.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_alert_sink_records_failed_delivery() {
        let sink = MockAlertSink::new().with_error("smtp down");
        assert!(sink.send_alert("title", "body").await.is_err());
        assert_eq!(sink.alerts(), vec![("title".to_string(), "body".to_string())]);
    }

    #[tokio::test]
    async fn test_mock_conclusion_sink_handle() {
        let sink = MockConclusionSink::new();
        let log = sink.handle();
        sink.send_conclusion(&[ResultSummary::new("a")])
            .await
            .expect("deliver");
        assert_eq!(log.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_mock_job_source() {
        let source = MockJobSource::new(vec![Job::new("a", "a")]);
        assert_eq!(source.load_jobs().expect("jobs").len(), 1);
        assert!(MockJobSource::new(Vec::new())
            .with_error("unreadable")
            .load_jobs()
            .is_err());
    }
}
