//! Error types for extrinsic orchestration

use thiserror::Error;

/// Main error type for fee estimation and submission.
///
/// Errors are `Clone` so a single upstream failure can be shared by every
/// unit that depends on it and replicated across batch result slots.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtrinsicError {
    #[error("Operation cancelled before a result was produced")]
    Cancelled,

    #[error("Builder error: {0}")]
    Builder(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Runtime metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node rejected request (code {code:?}): {message}")]
    NodeRejection { code: Option<i64>, message: String },

    #[error("Extrinsic reached terminal status {status}")]
    TerminalStatus { status: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtrinsicError {
    /// Whether the graph was aborted rather than failing on its own
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExtrinsicError::Cancelled)
    }

    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExtrinsicError::Transport(_) | ExtrinsicError::Timeout { .. }
        )
    }

    /// Stable label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ExtrinsicError::Cancelled => "cancelled",
            ExtrinsicError::Builder(_) => "builder",
            ExtrinsicError::Encoding(_) => "encoding",
            ExtrinsicError::MetadataUnavailable(_) => "metadata",
            ExtrinsicError::Signing(_) => "signing",
            ExtrinsicError::Transport(_) => "transport",
            ExtrinsicError::NodeRejection { .. } => "node_rejection",
            ExtrinsicError::TerminalStatus { .. } => "terminal_status",
            ExtrinsicError::Timeout { .. } => "timeout",
            ExtrinsicError::Config(_) => "config",
            ExtrinsicError::Internal(_) => "internal",
        }
    }
}

/// Result type for extrinsic operations
pub type ExtrinsicResult<T> = Result<T, ExtrinsicError>;
