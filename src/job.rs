//! Job, assignment and result types shared by the supervisor, the worker
//! runtime and the pipeline.
//!
//! Everything here crosses the process boundary, so every type is
//! serde-serializable and carries no runtime handles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One account's unit of work for a run.
///
/// # Example
///
/// ```
/// use drover::job::Job;
///
/// let job = Job::new("acct-1", "someone@example.com");
/// assert!(!job.do_later);
/// assert!(!job.compromised);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Stable identifier used in logs, alerts and summaries.
    pub id: String,
    /// Account reference handed to the executor (login name, profile key...).
    pub account: String,
    /// Opaque per-account settings forwarded to the executor.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Login-class failure seen this pass; queued for the end-of-batch retry.
    #[serde(default)]
    pub do_later: bool,
    /// Compromise detected for this account during the current attempt.
    #[serde(default)]
    pub compromised: bool,
}

impl Job {
    /// Create a job with no extra configuration.
    pub fn new(id: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account: account.into(),
            config: serde_json::Map::new(),
            do_later: false,
            compromised: false,
        }
    }

    /// Clear the transient per-attempt flags.
    pub fn clear_transient_flags(&mut self) {
        self.do_later = false;
        self.compromised = false;
    }
}

/// An ordered batch of jobs plus a start delay, sent to exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Jobs in the order the worker must run them.
    pub jobs: Vec<Job>,
    /// How long the worker waits before touching the first job.
    pub start_delay: Duration,
    /// Zero-based position of this assignment in the run.
    pub index: usize,
    /// Number of assignments in the run.
    pub total: usize,
}

impl Assignment {
    /// Copy of this assignment for a crash-recovery replacement: same jobs,
    /// no start delay.
    #[must_use]
    pub fn for_restart(&self) -> Self {
        Self {
            start_delay: Duration::ZERO,
            ..self.clone()
        }
    }
}

/// The two task flavours executed for every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Primary,
    Secondary,
}

impl Variant {
    /// Both variants in execution order.
    pub const ALL: [Variant; 2] = [Variant::Primary, Variant::Secondary];

    /// Lowercase name used in env vars, logs and point categories.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Primary => "primary",
            Variant::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one executor call reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    /// Account balance observed before the variant started, if known.
    #[serde(default)]
    pub initial_points: Option<u64>,
    /// Points gained by this variant.
    #[serde(default)]
    pub collected_points: u64,
    /// Optional breakdown of `collected_points` by category.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub categories: BTreeMap<String, u64>,
    /// Work units finished by this call, to be marked in the ledger.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_units: Vec<String>,
}

impl TaskOutcome {
    /// Outcome with a known baseline and a collected amount.
    #[must_use]
    pub fn new(initial_points: u64, collected_points: u64) -> Self {
        Self {
            initial_points: Some(initial_points),
            collected_points,
            ..Self::default()
        }
    }
}

/// Ban/compromise status attached to a summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanInfo {
    pub status: bool,
    pub reason: String,
}

/// Result of one job attempt, sent from a worker to the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub job_id: String,
    pub duration: Duration,
    /// Points collected per category (variant name unless the executor
    /// reports a finer breakdown).
    pub points: BTreeMap<String, u64>,
    /// Reconciled starting balance.
    pub initial_total: u64,
    /// `final - initial_total`.
    pub total_collected: u64,
    pub errors: Vec<String>,
    pub banned: BanInfo,
    /// The halt was a compromise rather than a ban.
    #[serde(default)]
    pub compromised: bool,
}

impl ResultSummary {
    /// Empty summary for the given job.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    /// Whether the attempt finished without any recorded error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.banned.status
    }
}
