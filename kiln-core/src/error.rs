//! Error types for kiln.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Every variant maps onto one [`ErrorKind`] of the build error taxonomy, which
//! decides retryability, whether the build must stop, and the process exit code.

use crate::builder::cache::CacheError;
use crate::builder::graph::GraphError;
use crate::builder::parser::ParseError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Error taxonomy shared by every component of the build engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed Dockerfile or invalid configuration.
    Parse,
    /// Cycle or dangling input in the operation graph.
    Graph,
    /// Disk I/O under the cache root.
    Cache,
    /// An operation failed to execute (also used for exporter failures).
    Executor,
    /// Pull/push/auth failure against a registry.
    Registry,
    /// Permit limit exceeded under a hard resource limit.
    Resource,
    /// Per-operation, per-stage or overall deadline expired.
    Timeout,
    /// User or parent cancellation.
    Cancelled,
}

impl ErrorKind {
    /// Get the kind name as it appears in reports (e.g., "parse").
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Graph => "graph",
            ErrorKind::Cache => "cache",
            ErrorKind::Executor => "executor",
            ErrorKind::Registry => "registry",
            ErrorKind::Resource => "resource",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether a caller may retry the failed step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Cache | ErrorKind::Registry)
    }

    /// Whether this kind of error ends the build (or the affected platform build).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::Cache)
    }

    /// Relative severity used to pick the exit code when several kinds occur.
    pub fn severity(&self) -> u8 {
        match self {
            ErrorKind::Cache => 0,
            ErrorKind::Registry => 1,
            ErrorKind::Executor => 2,
            ErrorKind::Timeout => 3,
            ErrorKind::Cancelled => 4,
            ErrorKind::Resource => 5,
            ErrorKind::Graph => 6,
            ErrorKind::Parse => 7,
        }
    }

    /// Process exit code for a build that failed with this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Parse => 2,
            ErrorKind::Graph => 3,
            ErrorKind::Cache => 4,
            ErrorKind::Executor => 5,
            ErrorKind::Registry => 6,
            ErrorKind::Resource => 7,
            ErrorKind::Timeout => 8,
            ErrorKind::Cancelled => 130,
        }
    }

    /// Pick the most severe kind out of a set of failures.
    pub fn most_severe(kinds: impl IntoIterator<Item = ErrorKind>) -> Option<ErrorKind> {
        kinds.into_iter().max_by_key(|k| k.severity())
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for kiln.
#[derive(Error, Debug)]
pub enum KilnError {
    // Frontend errors
    #[error("Dockerfile parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Failed to read {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Solver errors
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    // Cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    // Execution errors
    #[error("Operation {operation} failed: {reason}")]
    ExecutionFailed { operation: String, reason: String },

    #[error("Executor {executor} is not available: {reason}")]
    ExecutorUnavailable { executor: String, reason: String },

    #[error("Export failed: {reason}")]
    ExportFailed { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Registry errors
    #[error("Registry error for {reference}: {reason}")]
    Registry { reference: String, reason: String },

    // Resource errors
    #[error("Resource limit exceeded: {reason}")]
    ResourceExhausted { reason: String },

    // Scope errors
    #[error("{scope} timed out after {after:?}")]
    Timeout { scope: String, after: Duration },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Shorthand for a cancellation with a reason.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled { reason: reason.into() }
    }

    /// Category of this error in the build error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KilnError::Parse(_) | KilnError::InvalidConfig { .. } | KilnError::ReadFailed { .. } => {
                ErrorKind::Parse
            }
            KilnError::Graph(_) => ErrorKind::Graph,
            KilnError::Cache(_) => ErrorKind::Cache,
            KilnError::ExecutionFailed { .. }
            | KilnError::ExecutorUnavailable { .. }
            | KilnError::ExportFailed { .. }
            | KilnError::Io { .. }
            | KilnError::Internal(_)
            | KilnError::Other(_) => ErrorKind::Executor,
            KilnError::Registry { .. } => ErrorKind::Registry,
            KilnError::ResourceExhausted { .. } => ErrorKind::Resource,
            KilnError::Timeout { .. } => ErrorKind::Timeout,
            KilnError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}
