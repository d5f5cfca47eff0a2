//! drover - multi-process account job orchestrator
//!
//! Runs a batch of per-account jobs across several worker processes with
//! staggered starts, crash recovery, adaptive pacing and idempotent
//! same-day reruns. A ban or compromise detected on any account puts that
//! worker into global standby and raises exactly one alert.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`supervisor`] - Partitioning, worker pool, crash recovery and aggregation
//! - [`worker`] - Worker runtime serving one assignment over IPC
//! - [`pipeline`] - Per-job state machine and the batch loop
//! - [`job`] - Jobs, assignments, task outcomes and result summaries
//! - [`standby`] - Process-wide global standby flag
//! - [`ipc`] - Line-delimited JSON protocol between supervisor and workers
//! - [`retry`] - Bounded retry policy
//! - [`throttle`] - Adaptive delay scaling
//! - [`ledger`] - Per-day completion ledger
//! - [`classify`] - Failure classification
//! - [`notify`] - Alert and conclusion sinks
//! - [`hooks`] - Post-run hook command
//! - [`liveness`] - Heartbeat file for external schedulers
//! - [`interfaces`] - Collaborator traits (executor, sinks, job source)
//! - [`operations`] - Command-backed executor and file job source
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (mocks, fixtures, in-process launcher, log capture)
//!
//! # Example
//!
//! ```rust,ignore
//! use drover::config::DroverConfig;
//! use drover::supervisor::{ProcessLauncher, Supervisor};
//!
//! let config = DroverConfig::load(Path::new("drover.toml"))?;
//! let launcher = ProcessLauncher::current_exe(vec!["worker".into()])?;
//! let supervisor = Supervisor::new(config.supervisor, Arc::new(launcher), conclusion);
//! let report = supervisor.run(jobs).await?;
//! report.print_summary();
//! ```

pub mod classify;
pub mod config;
pub mod error;
pub mod hooks;
pub mod interfaces;
pub mod ipc;
pub mod job;
pub mod ledger;
pub mod liveness;
pub mod notify;
pub mod operations;
pub mod pipeline;
pub mod retry;
pub mod standby;
pub mod supervisor;
pub mod testing;
pub mod throttle;
pub mod worker;

// Re-export commonly used types
pub use error::{DroverError, IntoDroverError, Result};

pub use config::DroverConfig;
pub use interfaces::{
    AlertSink, ConclusionSink, ExecutionContext, FailureClassifier, JobSource, TaskExecutor,
};
pub use job::{Assignment, Job, ResultSummary, TaskOutcome, Variant};
pub use pipeline::{AccountPipeline, BatchOutcome, ExecutionMode, PipelineConfig};
pub use standby::GlobalStandby;
pub use supervisor::{RunReport, Supervisor, SupervisorConfig};
pub use worker::WorkerRuntime;
