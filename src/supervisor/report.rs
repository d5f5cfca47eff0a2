//! Run aggregation and the final report.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::job::ResultSummary;

/// Reduce the summaries of a run to one per job, keeping the latest.
///
/// Replacement workers re-run the jobs of a crashed worker, so the same job
/// id can be reported twice. The result keeps first-seen job order.
#[must_use]
pub fn aggregate(summaries: Vec<ResultSummary>) -> Vec<ResultSummary> {
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut reduced: Vec<ResultSummary> = Vec::new();

    for summary in summaries {
        match position.get(&summary.job_id) {
            Some(&idx) => reduced[idx] = summary,
            None => {
                position.insert(summary.job_id.clone(), reduced.len());
                reduced.push(summary);
            }
        }
    }
    reduced
}

/// Outcome of one supervisor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Random identifier of this run.
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Assignments launched (replacements excluded).
    pub workers: usize,
    /// Crash-recovery attempts per worker id.
    pub restarts: BTreeMap<usize, u32>,
    /// Workers whose last exit was non-zero.
    pub failed_workers: Vec<usize>,
    /// A termination signal was relayed during the run.
    pub interrupted: bool,
    /// One summary per job that reported.
    pub summaries: Vec<ResultSummary>,
}

impl RunReport {
    /// Points collected across every job.
    #[must_use]
    pub fn total_collected(&self) -> u64 {
        self.summaries.iter().map(|s| s.total_collected).sum()
    }

    /// Jobs that recorded at least one error.
    #[must_use]
    pub fn jobs_with_errors(&self) -> Vec<&ResultSummary> {
        self.summaries.iter().filter(|s| !s.errors.is_empty()).collect()
    }

    /// Jobs flagged as banned or compromised.
    #[must_use]
    pub fn banned_jobs(&self) -> Vec<&ResultSummary> {
        self.summaries.iter().filter(|s| s.banned.status).collect()
    }

    /// No banned jobs and no failed workers.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.banned_jobs().is_empty() && self.failed_workers.is_empty()
    }

    /// Print a human-readable summary to stdout.
    pub fn print_summary(&self) {
        let elapsed = (self.finished_at - self.started_at).num_seconds();
        println!();
        println!("{}", "═══ Run summary ═══".bright_cyan().bold());
        println!("  Run: {}", self.run_id.dimmed());
        println!(
            "  Workers: {}   Jobs reported: {}   Duration: {}s",
            self.workers,
            self.summaries.len(),
            elapsed
        );
        println!(
            "  Collected: {}",
            self.total_collected().to_string().green().bold()
        );

        for summary in &self.summaries {
            let status = if summary.compromised {
                "COMPROMISED".red().bold()
            } else if summary.banned.status {
                "BANNED".red().bold()
            } else if summary.errors.is_empty() {
                "ok".green()
            } else {
                "errors".yellow()
            };
            println!(
                "  {:<24} {:>8} +{:<6} {}",
                summary.job_id, summary.initial_total, summary.total_collected, status
            );
            if summary.banned.status {
                println!("      {}", summary.banned.reason.red());
            }
            for error in &summary.errors {
                println!("      {}", error.dimmed());
            }
        }

        let restarts: u32 = self.restarts.values().sum();
        if restarts > 0 {
            println!("  {} worker restart(s)", restarts.to_string().yellow());
        }
        if !self.failed_workers.is_empty() {
            println!(
                "  {} worker(s) failed permanently: {:?}",
                self.failed_workers.len().to_string().red(),
                self.failed_workers
            );
        }
        if self.interrupted {
            println!("  {}", "Run interrupted by signal".yellow());
        }
    }
}
