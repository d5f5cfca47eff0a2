//! Worker launching.
//!
//! The supervisor only sees workers through [`WorkerLauncher`] and
//! [`WorkerHandle`]: a launched worker already holds its assignment, reports
//! through the shared event channel and can be asked to drain. Everything
//! else (process spawning, pipes) stays behind the trait, so tests can run
//! workers in-process.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{DroverError, Result};
use crate::ipc::{decode, MessageReader, MessageWriter, SupervisorMessage, WorkerMessage};
use crate::job::Assignment;

/// Environment variable carrying the worker id into a worker process.
pub const WORKER_ID_ENV: &str = "DROVER_WORKER_ID";

/// Something that happened to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A protocol message arrived.
    Message {
        worker_id: usize,
        message: WorkerMessage,
    },
    /// The worker is gone. `None` means killed by a signal or never started.
    Exited { worker_id: usize, code: Option<i32> },
}

/// Control side of a running worker.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Ask the worker to finish its in-flight job and exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker's channel is already closed.
    async fn relay_shutdown(&mut self) -> Result<()>;
}

/// Starts workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `assignment`. Messages and the final exit are
    /// reported on `events`; exactly one `Exited` event follows every
    /// successful launch.
    ///
    /// # Errors
    ///
    /// Returns [`DroverError::WorkerLaunch`] if the worker could not start.
    async fn launch(
        &self,
        worker_id: usize,
        assignment: &Assignment,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerHandle>>;
}

/// [`WorkerHandle`] writing protocol messages into the worker's input.
pub struct ChannelHandle<W> {
    writer: MessageWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> ChannelHandle<W> {
    /// Send the assignment and keep the channel for later control messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the assignment cannot be written.
    pub async fn open(writer: W, assignment: &Assignment) -> Result<Self> {
        let mut writer = MessageWriter::new(writer);
        writer
            .send(&SupervisorMessage::Assignment {
                assignment: assignment.clone(),
            })
            .await?;
        Ok(Self { writer })
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> WorkerHandle for ChannelHandle<W> {
    async fn relay_shutdown(&mut self) -> Result<()> {
        self.writer.send(&SupervisorMessage::Shutdown).await
    }
}

/// Forward a worker's output as events, then report its exit.
///
/// Lines that are not protocol messages (stray prints) are forwarded as
/// log lines.
pub fn spawn_event_pump<R, F>(
    worker_id: usize,
    reader: R,
    exit: F,
    events: UnboundedSender<WorkerEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Future<Output = Option<i32>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = MessageReader::new(reader);
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    let message = decode::<WorkerMessage>(&line)
                        .unwrap_or(WorkerMessage::Log { payload: line });
                    if events.send(WorkerEvent::Message { worker_id, message }).is_err() {
                        debug!("Supervisor stopped listening to worker {}", worker_id);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Worker {} output unreadable: {}", worker_id, e);
                    break;
                }
            }
        }

        let code = exit.await;
        let _ = events.send(WorkerEvent::Exited { worker_id, code });
    })
}

/// Launches workers as child processes of a program (normally this binary
/// with the internal `worker` subcommand).
///
/// Stdin and stdout carry the protocol; stderr is inherited.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Launcher re-executing the current binary with `args`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable cannot be located.
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    /// Extra environment for every worker.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        worker_id: usize,
        assignment: &Assignment,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let launch_error = |message: String| DroverError::WorkerLaunch { worker_id, message };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(WORKER_ID_ENV, worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| launch_error(format!("{}: {}", self.program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error("stdout not captured".into()))?;

        debug!("Worker {} started (pid {:?})", worker_id, child.id());

        // Dropping stdin on failure makes the worker exit on EOF
        let handle = ChannelHandle::open(stdin, assignment)
            .await
            .map_err(|e| launch_error(format!("failed to send assignment: {e}")))?;

        let exit = async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for worker process: {}", e);
                    None
                }
            }
        };
        spawn_event_pump(worker_id, stdout, exit, events);
        Ok(Box::new(handle))
    }
}
