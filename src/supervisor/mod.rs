//! Supervisor - partitions jobs, runs workers and aggregates results.
//!
//! # Modules
//!
//! - [`partition`] - Even job partitioning and staggered start delays
//! - [`launcher`] - Worker launching seam and the child-process launcher
//! - [`report`] - Summary aggregation and the run report
//!
//! # Lifecycle
//!
//! ```text
//! plan_assignments ──> launch N workers ──> event loop ──> aggregate once
//!                                │  ▲
//!                     exit != 0  │  │ replacement (same jobs, no delay)
//!                                └──┘ while attempts[worker_id] < max_restarts
//! ```
//!
//! A termination signal is relayed to every live worker as an IPC shutdown
//! message. Workers are never killed.

pub mod launcher;
pub mod partition;
pub mod report;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{DroverError, Result};
use crate::hooks::PostRunHook;
use crate::interfaces::ConclusionSink;
use crate::ipc::WorkerMessage;
use crate::job::{Assignment, Job};
use crate::liveness::{Heartbeat, DEFAULT_HEARTBEAT_INTERVAL};
use crate::notify::deliver_conclusion;
use crate::throttle::DelayRange;

pub use launcher::{ProcessLauncher, WorkerEvent, WorkerHandle, WorkerLauncher};
pub use partition::{partition, plan_assignments, shared_account};
pub use report::{aggregate, RunReport};

/// Supervisor tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Upper bound on concurrent worker processes.
    pub workers: usize,
    /// Start-delay window for every assignment but the first, in ms.
    pub stagger: DelayRange,
    /// Replace crashed workers.
    pub crash_recovery: bool,
    /// Replacements allowed per worker id.
    pub max_restarts: u32,
    /// Liveness file (overridden by `DROVER_HEARTBEAT_FILE` when unset).
    pub heartbeat_file: Option<PathBuf>,
    pub heartbeat_interval_secs: u64,
    /// Command run once after aggregation.
    pub post_run_hook: Option<PostRunHook>,
    /// Directory for JSON run reports.
    pub report_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            stagger: DelayRange::new(30 * 60 * 1000, 60 * 60 * 1000),
            crash_recovery: true,
            max_restarts: 2,
            heartbeat_file: None,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            post_run_hook: None,
            report_dir: None,
        }
    }
}

/// Requests a graceful shutdown of a running supervisor.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Relay shutdown to every live worker. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Owns the worker pool for one run.
pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    conclusion: Arc<dyn ConclusionSink>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Mutable state of the event loop.
#[derive(Default)]
struct Pool {
    handles: HashMap<usize, Box<dyn WorkerHandle>>,
    restarts: BTreeMap<usize, u32>,
    failed: Vec<usize>,
    live: usize,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        conclusion: Arc<dyn ConclusionSink>,
    ) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            config,
            launcher,
            conclusion,
            shutdown: Arc::new(tx),
        }
    }

    /// Handle for signal listeners.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Run every job to completion and aggregate the results once.
    ///
    /// # Errors
    ///
    /// Worker failures are absorbed by crash recovery; this only fails on
    /// errors outside the worker pool.
    pub async fn run(&self, jobs: Vec<Job>) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let job_count = jobs.len();
        if let Some((first, second)) = shared_account(&jobs) {
            return Err(DroverError::JobLoad {
                message: format!(
                    "jobs {} and {} refer to the same account {:?}",
                    first.id,
                    second.id,
                    second.account.trim()
                ),
            });
        }
        let assignments = plan_assignments(jobs, self.config.workers, self.config.stagger);
        info!(
            "Starting {} worker(s) for {} job(s)",
            assignments.len(),
            job_count
        );

        let heartbeat = Heartbeat::resolve(
            self.config.heartbeat_file.as_deref(),
            Duration::from_secs(self.config.heartbeat_interval_secs),
        )
        .map(Heartbeat::spawn);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut shutdown = self.shutdown.subscribe();
        let mut pool = Pool::default();
        let mut summaries = Vec::new();
        let mut draining = false;
        let mut listening = true;

        for assignment in &assignments {
            if assignment.start_delay.is_zero() {
                info!("Worker {} starts now", assignment.index);
            } else {
                info!(
                    "Worker {} starts in {}s",
                    assignment.index,
                    assignment.start_delay.as_secs()
                );
            }
            self.start(assignment, &events_tx, &mut pool).await;
        }

        if *shutdown.borrow_and_update() {
            draining = true;
            relay_shutdown(&mut pool).await;
        }

        while pool.live > 0 {
            tokio::select! {
                Some(event) = events_rx.recv() => match event {
                    WorkerEvent::Message { worker_id, message: WorkerMessage::Summary { data } } => {
                        info!("Worker {} reported {} summary(ies)", worker_id, data.len());
                        summaries.extend(data);
                    }
                    WorkerEvent::Message { worker_id, message: WorkerMessage::Log { payload } } => {
                        info!(worker = worker_id, "{}", payload);
                    }
                    WorkerEvent::Exited { worker_id, code } => {
                        pool.live -= 1;
                        pool.handles.remove(&worker_id);
                        if code == Some(0) {
                            info!("Worker {} finished", worker_id);
                        } else if let Some(assignment) = assignments.get(worker_id) {
                            self.on_crash(assignment, code, draining, &events_tx, &mut pool).await;
                        }
                    }
                },
                changed = shutdown.changed(), if listening => {
                    if changed.is_err() {
                        listening = false;
                        continue;
                    }
                    let requested = *shutdown.borrow_and_update();
                    if requested && !draining {
                        warn!("Shutdown requested, relaying to {} worker(s)", pool.handles.len());
                        draining = true;
                        listening = false;
                        relay_shutdown(&mut pool).await;
                    }
                }
            }
        }

        if let Some(task) = heartbeat {
            task.abort();
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            workers: assignments.len(),
            restarts: pool.restarts,
            failed_workers: pool.failed,
            interrupted: draining,
            summaries: aggregate(summaries),
        };
        self.finish(&report).await;
        Ok(report)
    }

    /// Launch one worker. A launch failure is reported as an exit so crash
    /// recovery treats it like any other crash.
    async fn start(
        &self,
        assignment: &Assignment,
        events: &UnboundedSender<WorkerEvent>,
        pool: &mut Pool,
    ) {
        let worker_id = assignment.index;
        pool.live += 1;
        match self
            .launcher
            .launch(worker_id, assignment, events.clone())
            .await
        {
            Ok(handle) => {
                pool.handles.insert(worker_id, handle);
            }
            Err(e) => {
                error!("{}", e);
                let _ = events.send(WorkerEvent::Exited {
                    worker_id,
                    code: None,
                });
            }
        }
    }

    async fn on_crash(
        &self,
        assignment: &Assignment,
        code: Option<i32>,
        draining: bool,
        events: &UnboundedSender<WorkerEvent>,
        pool: &mut Pool,
    ) {
        let worker_id = assignment.index;
        let exit = code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
        let attempts = pool.restarts.get(&worker_id).copied().unwrap_or(0);

        if draining || !self.config.crash_recovery {
            warn!("Worker {} exited with {}", worker_id, exit);
        } else if attempts < self.config.max_restarts {
            pool.restarts.insert(worker_id, attempts + 1);
            warn!(
                "Worker {} exited with {}, restarting ({}/{})",
                worker_id,
                exit,
                attempts + 1,
                self.config.max_restarts
            );
            self.start(&assignment.for_restart(), events, pool).await;
            return;
        } else {
            error!(
                "Worker {} exited with {} after {} restart(s), giving up",
                worker_id, exit, attempts
            );
        }

        if !pool.failed.contains(&worker_id) {
            pool.failed.push(worker_id);
        }
    }

    /// Final aggregation side effects.
    async fn finish(&self, report: &RunReport) {
        info!(
            "All workers done: {} job(s) reported, {} collected",
            report.summaries.len(),
            report.total_collected()
        );
        deliver_conclusion(self.conclusion.as_ref(), &report.summaries).await;

        if let Some(hook) = &self.config.post_run_hook {
            if let Err(e) = hook.run(report).await {
                warn!("{}", e);
            }
        }
    }
}

async fn relay_shutdown(pool: &mut Pool) {
    for (worker_id, handle) in &mut pool.handles {
        if let Err(e) = handle.relay_shutdown().await {
            warn!("Could not relay shutdown to worker {}: {}", worker_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CapturedLogs, MockConclusionSink};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Launcher whose workers exit immediately with scripted codes.
    struct ScriptedLauncher {
        exit_codes: Mutex<HashMap<usize, Vec<Option<i32>>>>,
        launches: Mutex<Vec<(usize, Duration)>>,
    }

    struct NoopHandle;

    #[async_trait]
    impl WorkerHandle for NoopHandle {
        async fn relay_shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl ScriptedLauncher {
        fn new(codes: &[(usize, Vec<Option<i32>>)]) -> Self {
            Self {
                exit_codes: Mutex::new(codes.iter().cloned().collect()),
                launches: Mutex::new(Vec::new()),
            }
        }

        fn launches_of(&self, worker_id: usize) -> Vec<Duration> {
            self.launches
                .lock()
                .expect("lock")
                .iter()
                .filter(|(id, _)| *id == worker_id)
                .map(|(_, delay)| *delay)
                .collect()
        }
    }

    #[async_trait]
    impl WorkerLauncher for ScriptedLauncher {
        async fn launch(
            &self,
            worker_id: usize,
            assignment: &Assignment,
            events: UnboundedSender<WorkerEvent>,
        ) -> Result<Box<dyn WorkerHandle>> {
            self.launches
                .lock()
                .expect("lock")
                .push((worker_id, assignment.start_delay));
            let code = {
                let mut codes = self.exit_codes.lock().expect("lock");
                let queue = codes.entry(worker_id).or_default();
                if queue.is_empty() {
                    Some(0)
                } else {
                    queue.remove(0)
                }
            };
            let _ = events.send(WorkerEvent::Message {
                worker_id,
                message: WorkerMessage::Log {
                    payload: format!("serving {} job(s)", assignment.jobs.len()),
                },
            });
            let mut summary = crate::job::ResultSummary::new(&assignment.jobs[0].id);
            summary.total_collected = 1;
            let _ = events.send(WorkerEvent::Message {
                worker_id,
                message: WorkerMessage::Summary {
                    data: vec![summary],
                },
            });
            let _ = events.send(WorkerEvent::Exited { worker_id, code });
            Ok(Box::new(NoopHandle))
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            workers: 2,
            stagger: DelayRange::new(1_000, 2_000),
            max_restarts: 2,
            ..SupervisorConfig::default()
        }
    }

    fn jobs(n: usize) -> Vec<Job> {
        (0..n).map(|i| Job::new(format!("job-{i}"), format!("acct-{i}"))).collect()
    }

    #[tokio::test]
    async fn test_crashing_worker_restarted_up_to_cap() {
        let launcher = Arc::new(ScriptedLauncher::new(&[(
            1,
            vec![Some(1), Some(1), Some(1), Some(1)],
        )]));
        let conclusion = MockConclusionSink::new();
        let received = conclusion.handle();
        let supervisor = Supervisor::new(config(), launcher.clone(), Arc::new(conclusion));

        let report = supervisor.run(jobs(4)).await.expect("run");

        // Initial launch plus two replacements, all without delay after the first
        let delays = launcher.launches_of(1);
        assert_eq!(delays.len(), 3);
        assert!(delays[1..].iter().all(Duration::is_zero));
        assert_eq!(launcher.launches_of(0).len(), 1);
        assert_eq!(report.restarts.get(&1), Some(&2));
        assert_eq!(report.failed_workers, vec![1]);

        // Aggregated exactly once, duplicates reduced
        let received = received.lock().expect("lock");
        assert_eq!(received.len(), 1);
        assert_eq!(report.summaries.len(), 2);
    }

    #[tokio::test]
    async fn test_recovered_worker_is_not_failed() {
        let launcher = Arc::new(ScriptedLauncher::new(&[(0, vec![None])]));
        let supervisor = Supervisor::new(
            config(),
            launcher.clone(),
            Arc::new(MockConclusionSink::new()),
        );

        let report = supervisor.run(jobs(2)).await.expect("run");

        assert_eq!(launcher.launches_of(0).len(), 2);
        assert!(report.failed_workers.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_crash_recovery_disabled() {
        let launcher = Arc::new(ScriptedLauncher::new(&[(0, vec![Some(1)])]));
        let supervisor = Supervisor::new(
            SupervisorConfig {
                crash_recovery: false,
                ..config()
            },
            launcher.clone(),
            Arc::new(MockConclusionSink::new()),
        );

        let report = supervisor.run(jobs(1)).await.expect("run");

        assert_eq!(launcher.launches_of(0).len(), 1);
        assert_eq!(report.failed_workers, vec![0]);
    }

    #[tokio::test]
    async fn test_worker_logs_are_emitted_as_events() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let supervisor = Supervisor::new(
            config(),
            Arc::new(ScriptedLauncher::new(&[])),
            Arc::new(MockConclusionSink::new()),
        );

        supervisor.run(jobs(3)).await.expect("run");

        let contents = logs.contents();
        assert!(contents.contains("worker=0"), "{contents}");
        assert!(contents.contains("worker=1"), "{contents}");
        assert!(contents.contains("serving 2 job(s)"), "{contents}");
        assert!(!contents.contains("[worker"), "{contents}");
    }

    #[tokio::test]
    async fn test_shared_account_is_rejected_before_launch() {
        let launcher = Arc::new(ScriptedLauncher::new(&[]));
        let supervisor = Supervisor::new(
            config(),
            launcher.clone(),
            Arc::new(MockConclusionSink::new()),
        );
        let jobs = vec![
            Job::new("first", "x@example.com"),
            Job::new("second", "other@example.com"),
            Job::new("third", " X@example.com "),
        ];

        let err = supervisor.run(jobs).await.expect_err("shared account");

        assert!(matches!(err, DroverError::JobLoad { .. }));
        assert!(err.to_string().contains("first"));
        assert!(err.to_string().contains("third"));
        assert!(launcher.launches_of(0).is_empty());
        assert!(launcher.launches_of(1).is_empty());
    }

    #[tokio::test]
    async fn test_no_jobs_still_concludes_once() {
        let conclusion = MockConclusionSink::new();
        let received = conclusion.handle();
        let supervisor = Supervisor::new(
            config(),
            Arc::new(ScriptedLauncher::new(&[])),
            Arc::new(conclusion),
        );

        let report = supervisor.run(Vec::new()).await.expect("run");

        assert_eq!(report.workers, 0);
        assert_eq!(received.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_shutdown_handle_is_idempotent() {
        let supervisor = Supervisor::new(
            config(),
            Arc::new(ScriptedLauncher::new(&[])),
            Arc::new(MockConclusionSink::new()),
        );
        let handle = supervisor.shutdown_handle();
        assert!(!handle.is_triggered());
        handle.trigger();
        handle.trigger();
        assert!(handle.is_triggered());
    }
}
