//! Custom error types for drover.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the orchestrator.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for drover operations
#[derive(Error, Debug)]
pub enum DroverError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Missing required file
    #[error("Missing required file: {path}")]
    MissingFile { path: PathBuf },

    // =========================================================================
    // Job Errors
    // =========================================================================
    /// Loading the job list failed
    #[error("Failed to load jobs: {message}")]
    JobLoad { message: String },

    /// Batch loop defect (escapes the pipeline boundary)
    #[error("Batch loop error: {message}")]
    Batch { message: String },

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// Worker process could not be launched
    #[error("Failed to launch worker {worker_id}: {message}")]
    WorkerLaunch { worker_id: usize, message: String },

    /// Malformed or unexpected inter-process message
    #[error("IPC protocol error: {message}")]
    Ipc { message: String },

    /// Worker channel closed before an assignment arrived
    #[error("Worker channel closed before an assignment was received")]
    NoAssignment,

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Ledger read/write failed
    #[error("Ledger error: {message}")]
    Ledger { message: String },

    // =========================================================================
    // Hook Errors
    // =========================================================================
    /// Post-run hook failed
    #[error("Hook '{name}' failed: {message}")]
    Hook { name: String, message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DroverError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an IPC protocol error
    pub fn ipc(message: impl Into<String>) -> Self {
        Self::Ipc {
            message: message.into(),
        }
    }

    /// Create a ledger error
    pub fn ledger(message: impl Into<String>) -> Self {
        Self::Ledger {
            message: message.into(),
        }
    }

    /// Create a batch loop error
    pub fn batch(message: impl Into<String>) -> Self {
        Self::Batch {
            message: message.into(),
        }
    }

    /// Create a hook error
    pub fn hook(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            name: name.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is recoverable by restarting the worker
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Batch { .. } | Self::Ipc { .. } | Self::Ledger { .. } | Self::Io(_)
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingFile { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::JobLoad { .. } => 8,
            _ => 1,
        }
    }
}

/// Type alias for drover results
pub type Result<T> = std::result::Result<T, DroverError>;

/// Extension trait for converting foreign errors to DroverError
pub trait IntoDroverError<T> {
    fn into_drover_config(self) -> Result<T>;
    fn into_drover_ledger(self) -> Result<T>;
    fn into_drover_ipc(self) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoDroverError<T> for std::result::Result<T, E> {
    fn into_drover_config(self) -> Result<T> {
        self.map_err(|e| DroverError::config(e.into().to_string()))
    }

    fn into_drover_ledger(self) -> Result<T> {
        self.map_err(|e| DroverError::ledger(e.into().to_string()))
    }

    fn into_drover_ipc(self) -> Result<T> {
        self.map_err(|e| DroverError::ipc(e.into().to_string()))
    }
}
