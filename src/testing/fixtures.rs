//! Ready-made jobs and configurations for tests.

use crate::job::Job;
use crate::pipeline::PipelineConfig;
use crate::retry::RetryPolicy;
use crate::throttle::DelayRange;

/// `count` jobs with ids `job-0..job-{count-1}`.
#[must_use]
pub fn jobs(count: usize) -> Vec<Job> {
    (0..count)
        .map(|i| Job::new(format!("job-{i}"), format!("account-{i}@example.com")))
        .collect()
}

/// Pipeline config with no delays and a single attempt per variant.
#[must_use]
pub fn instant_pipeline() -> PipelineConfig {
    PipelineConfig {
        pre_delay: DelayRange::ZERO,
        post_delay: DelayRange::ZERO,
        retry: RetryPolicy {
            max_attempts: 1,
            backoff_base_ms: 0,
            max_backoff_ms: 0,
        },
        ..PipelineConfig::default()
    }
}
