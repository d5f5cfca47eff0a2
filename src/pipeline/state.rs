//! Per-job state machine.
//!
//! ```text
//! Idle ─> PreDelay ─> Executing ─> Classifying ─┬─> PostDelay ─> Recorded
//!                                               ├─> RetryQueued ─> PostDelay
//!                                               └─> GlobalStandby
//! ```
//!
//! `Recorded` ends the job; `GlobalStandby` ends the job and the batch.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DroverError, Result};

/// Pipeline state of a single job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    PreDelay,
    Executing,
    Classifying,
    PostDelay,
    Recorded,
    RetryQueued,
    GlobalStandby,
}

impl JobState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// # Example
    ///
    /// ```
    /// use drover::pipeline::state::JobState;
    ///
    /// assert!(JobState::Classifying.can_transition_to(JobState::RetryQueued));
    /// assert!(!JobState::Idle.can_transition_to(JobState::Executing));
    /// ```
    #[must_use]
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Idle, PreDelay)
                | (PreDelay, Executing)
                | (Executing, Classifying)
                | (Classifying, PostDelay)
                | (Classifying, RetryQueued)
                | (Classifying, GlobalStandby)
                | (RetryQueued, PostDelay)
                | (PostDelay, Recorded)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Recorded | JobState::GlobalStandby)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::PreDelay => "pre_delay",
            JobState::Executing => "executing",
            JobState::Classifying => "classifying",
            JobState::PostDelay => "post_delay",
            JobState::Recorded => "recorded",
            JobState::RetryQueued => "retry_queued",
            JobState::GlobalStandby => "global_standby",
        };
        f.write_str(name)
    }
}

/// Tracks one job's path through [`JobState`], rejecting illegal moves.
#[derive(Debug, Clone)]
pub struct JobStateMachine {
    job_id: String,
    state: JobState,
    history: Vec<JobState>,
}

impl JobStateMachine {
    /// Start a machine in `Idle`.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Idle,
            history: vec![JobState::Idle],
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state visited so far, `Idle` first.
    #[must_use]
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// An illegal transition is a batch-loop defect and is returned as
    /// [`DroverError::Batch`].
    pub fn advance(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DroverError::batch(format!(
                "job {}: illegal transition {} -> {}",
                self.job_id, self.state, next
            )));
        }
        debug!("Job {}: {} -> {}", self.job_id, self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}
