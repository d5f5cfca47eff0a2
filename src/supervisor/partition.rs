//! Job partitioning and assignment planning.

use std::collections::HashMap;
use std::time::Duration;

use crate::job::{Assignment, Job};
use crate::ledger::JobLedger;
use crate::throttle::DelayRange;

/// Split `jobs` into at most `worker_count` contiguous, non-empty groups
/// whose sizes differ by at most one. Job order is preserved.
///
/// # Example
///
/// ```
/// use drover::job::Job;
/// use drover::supervisor::partition::partition;
///
/// let jobs: Vec<Job> = (0..5).map(|i| Job::new(i.to_string(), "acct")).collect();
/// let groups = partition(jobs, 2);
/// assert_eq!(groups.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 2]);
/// ```
#[must_use]
pub fn partition(jobs: Vec<Job>, worker_count: usize) -> Vec<Vec<Job>> {
    if jobs.is_empty() {
        return Vec::new();
    }

    let workers = worker_count.clamp(1, jobs.len());
    let base = jobs.len() / workers;
    let extra = jobs.len() % workers;

    let mut remaining = jobs.into_iter();
    (0..workers)
        .map(|i| {
            let size = base + usize::from(i < extra);
            remaining.by_ref().take(size).collect()
        })
        .collect()
}

/// First pair of jobs that resolve to the same ledger account.
///
/// Partitioning is positional, so such a pair could land in two workers and
/// touch one account concurrently. Callers reject the batch instead.
#[must_use]
pub fn shared_account(jobs: &[Job]) -> Option<(&Job, &Job)> {
    let mut owners: HashMap<String, &Job> = HashMap::with_capacity(jobs.len());
    for job in jobs {
        if let Some(first) = owners.insert(JobLedger::account_key(&job.account), job) {
            return Some((first, job));
        }
    }
    None
}

/// Partition `jobs` and attach start delays.
///
/// Assignment 0 starts immediately; every other assignment waits a delay
/// drawn uniformly from `stagger`.
#[must_use]
pub fn plan_assignments(jobs: Vec<Job>, worker_count: usize, stagger: DelayRange) -> Vec<Assignment> {
    let groups = partition(jobs, worker_count);
    let total = groups.len();

    groups
        .into_iter()
        .enumerate()
        .map(|(index, jobs)| Assignment {
            jobs,
            start_delay: if index == 0 {
                Duration::ZERO
            } else {
                stagger.sample()
            },
            index,
            total,
        })
        .collect()
}
