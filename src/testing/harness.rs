//! In-process worker launcher.
//!
//! Runs each [`WorkerRuntime`] as a tokio task connected to the supervisor
//! through an in-memory duplex pipe. The wire protocol is the same one
//! child processes speak, so supervisor tests exercise the real encoding.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::job::Assignment;
use crate::standby::GlobalStandby;
use crate::supervisor::launcher::{
    spawn_event_pump, ChannelHandle, WorkerEvent, WorkerHandle, WorkerLauncher,
};
use crate::worker::WorkerRuntime;

const PIPE_CAPACITY: usize = 64 * 1024;

type RuntimeFactory = dyn Fn(usize) -> WorkerRuntime + Send + Sync;

/// Launches workers as tasks built by a factory closure.
///
/// # Example
///
/// ```rust,ignore
/// let launcher = InProcessLauncher::new(move |_worker_id| {
///     WorkerRuntime::new(config.clone(), executor.clone(), classifier.clone(), alerts.clone(), ledger.clone())
///         .with_hold_on_standby(false)
/// });
/// ```
pub struct InProcessLauncher {
    factory: Arc<RuntimeFactory>,
    standbys: Mutex<BTreeMap<usize, GlobalStandby>>,
    launches: Mutex<BTreeMap<usize, u32>>,
}

impl InProcessLauncher {
    pub fn new(factory: impl Fn(usize) -> WorkerRuntime + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            standbys: Mutex::new(BTreeMap::new()),
            launches: Mutex::new(BTreeMap::new()),
        }
    }

    /// Standby context of the most recent runtime launched for `worker_id`.
    #[must_use]
    pub fn standby(&self, worker_id: usize) -> Option<GlobalStandby> {
        self.standbys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&worker_id)
            .cloned()
    }

    /// Times `worker_id` was launched.
    #[must_use]
    pub fn launches(&self, worker_id: usize) -> u32 {
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&worker_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(
        &self,
        worker_id: usize,
        assignment: &Assignment,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let runtime = (self.factory)(worker_id);
        self.standbys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker_id, runtime.standby());
        *self
            .launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(worker_id)
            .or_insert(0) += 1;

        let (supervisor_end, worker_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (supervisor_read, supervisor_write) = tokio::io::split(supervisor_end);
        let (worker_read, worker_write) = tokio::io::split(worker_end);

        let handle = ChannelHandle::open(supervisor_write, assignment).await?;
        let worker = tokio::spawn(runtime.run(worker_read, worker_write));
        spawn_event_pump(worker_id, supervisor_read, async move { worker.await.ok() }, events);

        Ok(Box::new(handle))
    }
}
