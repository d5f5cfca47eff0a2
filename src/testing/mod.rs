//! Testing infrastructure for drover.
//!
//! This module provides mocks, fixtures and an in-process worker launcher
//! for testing the pipeline, worker runtime and supervisor without child
//! processes or a real executor.
//!
//! - **Mocks**: Test doubles for the collaborator traits
//! - **Fixtures**: Ready-made jobs and configurations
//! - **Harness**: [`InProcessLauncher`] running workers as tasks
//! - **Logs**: [`CapturedLogs`] for assertions on emitted log lines
//!
//! # Example
//!
//! ```rust,ignore
//! use drover::testing::{jobs, MockExecutor};
//!
//! let executor = MockExecutor::new()
//!     .with_error("job-1", Variant::Primary, "Account has been suspended");
//! let batch = jobs(5);
//! ```

pub mod fixtures;
pub mod harness;
pub mod logs;
pub mod mocks;

pub use fixtures::*;
pub use harness::InProcessLauncher;
pub use logs::CapturedLogs;
pub use mocks::*;
