//! Line-delimited JSON protocol between the supervisor and its workers.
//!
//! Each message is one JSON object terminated by `\n`, written to the
//! worker's stdin (supervisor → worker) or stdout (worker → supervisor).
//!
//! ```text
//! supervisor ── {"type":"assignment","assignment":{..}} ──> worker
//! supervisor ── {"type":"shutdown"} ──────────────────────> worker
//! supervisor <── {"type":"log","payload":".."} ──────────── worker
//! supervisor <── {"type":"summary","data":[..]} ─────────── worker
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::error::{DroverError, Result};
use crate::job::{Assignment, ResultSummary};

/// Message sent from the supervisor to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    /// The worker's batch. Sent exactly once, first.
    Assignment { assignment: Assignment },
    /// Finish the in-flight job, report and exit.
    Shutdown,
}

/// Message sent from a worker to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Accumulated per-job results.
    Summary { data: Vec<ResultSummary> },
    /// One formatted log line.
    Log { payload: String },
}

/// Serialize a message as one protocol line, newline included.
///
/// # Example
///
/// ```
/// use drover::ipc::{encode, SupervisorMessage};
///
/// let line = encode(&SupervisorMessage::Shutdown).unwrap();
/// assert_eq!(line, "{\"type\":\"shutdown\"}\n");
/// ```
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one protocol line.
///
/// # Errors
///
/// Returns [`DroverError::Ipc`] for malformed or unknown messages.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| DroverError::ipc(format!("malformed message {:?}: {}", truncate(line), e)))
}

fn truncate(line: &str) -> &str {
    let line = line.trim();
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Reads protocol messages from an async byte stream.
pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next non-blank raw line, `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        while let Some(line) = self.lines.next_line().await? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Next decoded message, `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or a line is not a valid message.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.next_line().await? {
            Some(line) => decode(&line).map(Some),
            None => Ok(None),
        }
    }
}

/// Writes protocol messages to an async byte stream, flushing each one.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    /// Write and flush one message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the peer is gone.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let line = encode(message)?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
