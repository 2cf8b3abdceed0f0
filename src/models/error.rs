//! Error types for sieve.
//!
//! Taxonomy:
//! - Data errors: a view, checkpoint or column the caller asked for is absent
//! - Serving errors: transient (retried) or fatal (aborts the step)
//! - Pipeline errors: contract violations detected at step boundaries

use super::ConfigError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for sieve.
#[derive(Debug, Error)]
pub enum SieveError {
    // ═══════════════════════════════════════════════════════════════════
    // DATA: requested view, checkpoint or column is absent
    // ═══════════════════════════════════════════════════════════════════
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing column '{column}' (available: {available:?})")]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    Parse(String),

    // ═══════════════════════════════════════════════════════════════════
    // SERVING: backend failures
    // ═══════════════════════════════════════════════════════════════════
    #[error("Transient serving failure: {message}")]
    ServingTransient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Serving failure: {0}")]
    ServingFatal(String),

    // ═══════════════════════════════════════════════════════════════════
    // CONFIGURATION: registry, keys, parameters, config file
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    // ═══════════════════════════════════════════════════════════════════
    // PIPELINE: contract violations at step boundaries
    // ═══════════════════════════════════════════════════════════════════
    #[error("Row count changed from {before} to {after} in a row-preserving step")]
    RowCountChanged { before: usize, after: usize },

    #[error("Step {step} finished without writing a checkpoint")]
    NoCheckpointWritten { step: usize },

    #[error("Step {step} ({operator}) failed: {source}")]
    StepFailed {
        step: usize,
        operator: String,
        #[source]
        source: Box<SieveError>,
    },

    #[error("IO error: {context} ({path:?}): {source}")]
    Io {
        context: String,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SieveError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            path: None,
            source,
        }
    }

    /// Create an IO error with context and the path involved.
    pub fn io_at(context: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            path: Some(path.into()),
            source,
        }
    }

    /// Create a transient serving error without a retry hint.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::ServingTransient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServingTransient { .. })
    }

    /// Get the server-provided retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ServingTransient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Unwrap `StepFailed` layers down to the underlying cause.
    pub fn root_cause(&self) -> &SieveError {
        match self {
            Self::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type alias for sieve.
pub type Result<T> = std::result::Result<T, SieveError>;
