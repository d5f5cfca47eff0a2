//! Worker runtime: one process, one assignment, one sequential pipeline.
//!
//! The runtime waits for its [`Assignment`] on the IPC channel, sleeps the
//! start delay, runs the batch and reports every [`ResultSummary`] back
//! before exiting. All outgoing traffic (summaries and forwarded log lines)
//! goes through a single queue drained by one writer task, so lines never
//! interleave on the wire.
//!
//! [`ResultSummary`]: crate::job::ResultSummary

use std::io::{self, Write};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

use crate::error::{DroverError, Result};
use crate::interfaces::{AlertSink, FailureClassifier, TaskExecutor};
use crate::ipc::{MessageReader, MessageWriter, SupervisorMessage, WorkerMessage};
use crate::job::Assignment;
use crate::ledger::JobLedger;
use crate::pipeline::{AccountPipeline, BatchOutcome, PipelineConfig, StopFlag};
use crate::standby::GlobalStandby;
use crate::throttle::{AdaptiveThrottle, ThrottleConfig};

/// Exit code for a finished batch (including one halted by standby).
pub const EXIT_OK: i32 = 0;

/// Exit code when the batch loop failed or the channel broke.
pub const EXIT_FAILURE: i32 = 1;

enum Outbound {
    Message(WorkerMessage),
    Close,
}

/// Runs one assignment received over IPC.
pub struct WorkerRuntime {
    config: PipelineConfig,
    throttle: ThrottleConfig,
    hold_on_standby: bool,
    executor: Arc<dyn TaskExecutor>,
    classifier: Arc<dyn FailureClassifier>,
    alerts: Arc<dyn AlertSink>,
    ledger: JobLedger,
    standby: GlobalStandby,
    outbox: UnboundedSender<Outbound>,
    inbox: UnboundedReceiver<Outbound>,
}

impl WorkerRuntime {
    pub fn new(
        config: PipelineConfig,
        executor: Arc<dyn TaskExecutor>,
        classifier: Arc<dyn FailureClassifier>,
        alerts: Arc<dyn AlertSink>,
        ledger: JobLedger,
    ) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        Self {
            config,
            throttle: ThrottleConfig::default(),
            hold_on_standby: true,
            executor,
            classifier,
            alerts,
            ledger,
            standby: GlobalStandby::new(),
            outbox,
            inbox,
        }
    }

    /// Throttle tuning for this worker's pipeline.
    #[must_use]
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Stay alive after a standby-halted batch until shutdown or EOF.
    #[must_use]
    pub fn with_hold_on_standby(mut self, hold: bool) -> Self {
        self.hold_on_standby = hold;
        self
    }

    /// Use an existing standby context.
    #[must_use]
    pub fn with_standby(mut self, standby: GlobalStandby) -> Self {
        self.standby = standby;
        self
    }

    /// Handle to this process's standby context.
    #[must_use]
    pub fn standby(&self) -> GlobalStandby {
        self.standby.clone()
    }

    /// `tracing` writer that forwards formatted lines as IPC log messages.
    #[must_use]
    pub fn log_forwarder(&self) -> LogForwarder {
        LogForwarder {
            outbox: self.outbox.clone(),
        }
    }

    /// Serve one assignment and return the process exit code.
    pub async fn run<R, W>(self, reader: R, writer: W) -> i32
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let WorkerRuntime {
            config,
            throttle,
            hold_on_standby,
            executor,
            classifier,
            alerts,
            ledger,
            standby,
            outbox,
            inbox,
        } = self;

        let writer_task = tokio::spawn(drain_outbox(inbox, MessageWriter::new(writer)));
        let mut reader = MessageReader::new(reader);

        let assignment = match wait_for_assignment(&mut reader).await {
            Ok(Some(assignment)) => assignment,
            Ok(None) => {
                info!("Shutdown received before an assignment, exiting");
                close(outbox, writer_task).await;
                return EXIT_OK;
            }
            Err(e) => {
                error!("{}", e);
                close(outbox, writer_task).await;
                return EXIT_FAILURE;
            }
        };

        info!(
            "Worker {}/{}: {} job(s), start delay {:?}",
            assignment.index + 1,
            assignment.total,
            assignment.jobs.len(),
            assignment.start_delay
        );

        let stop = StopFlag::new();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(listen_for_shutdown(reader, stop.clone(), shutdown_tx));

        if !assignment.start_delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(assignment.start_delay) => {}
                _ = shutdown_rx.wait_for(|requested| *requested) => {
                    info!("Shutdown requested during the start delay");
                }
            }
        }

        let mut pipeline = AccountPipeline::new(config, executor, classifier, alerts, ledger, standby)
            .with_throttle(Arc::new(AdaptiveThrottle::new(throttle)))
            .with_stop_flag(stop);
        let result = pipeline.run_batch(assignment.jobs).await;

        let summaries = pipeline.take_summaries();
        if !pipeline.unprocessed_jobs().is_empty() {
            warn!(
                "{} job(s) left unprocessed: {}",
                pipeline.unprocessed_jobs().len(),
                pipeline.unprocessed_jobs().join(", ")
            );
        }
        info!("Reporting {} summary(ies)", summaries.len());
        send(&outbox, WorkerMessage::Summary { data: summaries });

        let code = match result {
            Ok(BatchOutcome::Standby) => {
                if hold_on_standby {
                    warn!("Global standby: holding this worker for manual inspection until shutdown");
                    let _ = shutdown_rx.wait_for(|requested| *requested).await;
                }
                EXIT_OK
            }
            Ok(BatchOutcome::Completed | BatchOutcome::Stopped) => EXIT_OK,
            Err(e) => {
                error!("Batch aborted: {}", e);
                EXIT_FAILURE
            }
        };

        listener.abort();
        close(outbox, writer_task).await;
        code
    }
}

/// Wait for the assignment. `Ok(None)` means shutdown arrived first.
async fn wait_for_assignment<R: AsyncRead + Unpin>(
    reader: &mut MessageReader<R>,
) -> Result<Option<Assignment>> {
    match reader.next::<SupervisorMessage>().await? {
        Some(SupervisorMessage::Assignment { assignment }) => Ok(Some(assignment)),
        Some(SupervisorMessage::Shutdown) => Ok(None),
        None => Err(DroverError::NoAssignment),
    }
}

/// Turn a shutdown message (or a closed channel) into a stop request.
async fn listen_for_shutdown<R: AsyncRead + Unpin>(
    mut reader: MessageReader<R>,
    stop: StopFlag,
    shutdown: watch::Sender<bool>,
) {
    loop {
        match reader.next::<SupervisorMessage>().await {
            Ok(Some(SupervisorMessage::Shutdown)) => {
                info!("Shutdown requested, finishing the current job");
                break;
            }
            Ok(Some(SupervisorMessage::Assignment { .. })) => {
                warn!("Ignoring a second assignment");
            }
            Ok(None) => {
                warn!("Supervisor channel closed, stopping after the current job");
                break;
            }
            Err(e) => warn!("{}", e),
        }
    }
    stop.request();
    let _ = shutdown.send(true);
}

async fn drain_outbox<W: AsyncWrite + Unpin>(
    mut inbox: UnboundedReceiver<Outbound>,
    mut writer: MessageWriter<W>,
) {
    while let Some(item) = inbox.recv().await {
        match item {
            Outbound::Message(message) => {
                // Logging here would feed back into the queue
                if let Err(e) = writer.send(&message).await {
                    eprintln!("drover worker: lost supervisor channel: {e}");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

fn send(outbox: &UnboundedSender<Outbound>, message: WorkerMessage) {
    if outbox.send(Outbound::Message(message)).is_err() {
        eprintln!("drover worker: outbound queue closed, message dropped");
    }
}

async fn close(outbox: UnboundedSender<Outbound>, writer_task: JoinHandle<()>) {
    let _ = outbox.send(Outbound::Close);
    drop(outbox);
    let _ = writer_task.await;
}

// ============================================================================
// Log forwarding
// ============================================================================

/// [`MakeWriter`] that turns each formatted event into an IPC `log` message.
///
/// Once the runtime has closed its channel, lines fall back to stderr.
#[derive(Clone)]
pub struct LogForwarder {
    outbox: UnboundedSender<Outbound>,
}

impl<'a> MakeWriter<'a> for LogForwarder {
    type Writer = ForwardedLines;

    fn make_writer(&'a self) -> Self::Writer {
        ForwardedLines {
            outbox: self.outbox.clone(),
            buf: Vec::new(),
        }
    }
}

/// Buffers one formatted event and forwards it when dropped.
pub struct ForwardedLines {
    outbox: UnboundedSender<Outbound>,
    buf: Vec<u8>,
}

impl Write for ForwardedLines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ForwardedLines {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let message = Outbound::Message(WorkerMessage::Log {
                payload: line.to_string(),
            });
            if self.outbox.send(message).is_err() {
                eprintln!("{line}");
            }
        }
    }
}
