//! Notification sinks.
//!
//! Delivery is fire-and-forget: [`deliver_alert`] and [`deliver_conclusion`]
//! swallow sink failures after logging them at warning level, so a broken
//! notifier can never change control flow.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::interfaces::{AlertSink, ConclusionSink};
use crate::job::ResultSummary;

/// Send an alert, logging and discarding any delivery error.
///
/// Returns whether the sink accepted the alert.
pub async fn deliver_alert(sink: &dyn AlertSink, title: &str, body: &str) -> bool {
    match sink.send_alert(title, body).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Alert delivery failed ({}): {:#}", title, e);
            false
        }
    }
}

/// Send the run conclusion, logging and discarding any delivery error.
///
/// Returns whether the sink accepted the conclusion.
pub async fn deliver_conclusion(sink: &dyn ConclusionSink, summaries: &[ResultSummary]) -> bool {
    match sink.send_conclusion(summaries).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Conclusion delivery failed: {:#}", e);
            false
        }
    }
}

/// Alert sink that writes to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send_alert(&self, title: &str, body: &str) -> Result<()> {
        error!("ALERT: {} | {}", title, body.replace('\n', " | "));
        Ok(())
    }
}

/// Conclusion sink that logs one line per job.
#[derive(Debug, Clone, Default)]
pub struct TracingConclusionSink;

#[async_trait]
impl ConclusionSink for TracingConclusionSink {
    async fn send_conclusion(&self, summaries: &[ResultSummary]) -> Result<()> {
        for summary in summaries {
            info!(
                "Conclusion: job {} collected {} (start {}, {} error(s){})",
                summary.job_id,
                summary.total_collected,
                summary.initial_total,
                summary.errors.len(),
                if summary.banned.status {
                    format!(", BANNED: {}", summary.banned.reason)
                } else {
                    String::new()
                }
            );
        }
        Ok(())
    }
}

/// Persisted run report.
#[derive(Debug, Serialize)]
struct ConclusionReport<'a> {
    generated_at: DateTime<Utc>,
    jobs: usize,
    total_collected: u64,
    summaries: &'a [ResultSummary],
}

/// Conclusion sink that saves a JSON report per run.
#[derive(Debug, Clone)]
pub struct ReportFileSink {
    dir: PathBuf,
}

impl ReportFileSink {
    /// Reports are written to `dir/conclusion-<timestamp>.json`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ConclusionSink for ReportFileSink {
    async fn send_conclusion(&self, summaries: &[ResultSummary]) -> Result<()> {
        let report = ConclusionReport {
            generated_at: Utc::now(),
            jobs: summaries.len(),
            total_collected: summaries.iter().map(|s| s.total_collected).sum(),
            summaries,
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.dir.join(format!(
            "conclusion-{}.json",
            report.generated_at.timestamp_millis()
        ));
        tokio::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Run report saved to {}", path.display());
        Ok(())
    }
}

/// Delivers a conclusion to several sinks in order; one failing sink does
/// not stop the others.
#[derive(Default)]
pub struct ConclusionFanOut {
    sinks: Vec<Box<dyn ConclusionSink>>,
}

impl ConclusionFanOut {
    /// An empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: impl ConclusionSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

#[async_trait]
impl ConclusionSink for ConclusionFanOut {
    async fn send_conclusion(&self, summaries: &[ResultSummary]) -> Result<()> {
        for sink in &self.sinks {
            deliver_conclusion(sink.as_ref(), summaries).await;
        }
        Ok(())
    }
}
