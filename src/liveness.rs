//! Liveness heartbeat file for external schedulers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// Environment variable naming the heartbeat file.
pub const HEARTBEAT_FILE_ENV: &str = "DROVER_HEARTBEAT_FILE";

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically overwrites a file with the current RFC 3339 timestamp.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    path: PathBuf,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(path: impl AsRef<Path>, interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// Heartbeat at `configured`, or at the path in [`HEARTBEAT_FILE_ENV`]
    /// when nothing is configured. `None` when neither is set.
    #[must_use]
    pub fn resolve(configured: Option<&Path>, interval: Duration) -> Option<Self> {
        configured
            .map(Path::to_path_buf)
            .or_else(|| {
                std::env::var_os(HEARTBEAT_FILE_ENV)
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from)
            })
            .map(|path| Self::new(path, interval))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn beat(&self) -> Result<()> {
        tokio::fs::write(&self.path, Utc::now().to_rfc3339()).await?;
        debug!("Heartbeat written to {}", self.path.display());
        Ok(())
    }

    /// Beat now and then every interval until the task is aborted.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.beat().await {
                    warn!("Heartbeat write to {} failed: {}", self.path.display(), e);
                }
            }
        })
    }
}
