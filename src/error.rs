//! Error types for pipeflow

use thiserror::Error;

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced by executors and their callbacks.
///
/// Errors are `Clone` because an executor's exit error is observed through
/// every clone of its handle (and adopted by downstream stages), and
/// `PartialEq` so callers can match on the sentinel variants the same way
/// they would compare against a sentinel error value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid executor configuration, reported at build time
    #[error("invalid executor configuration: {0}")]
    Config(String),

    /// A processing function returned an error
    #[error("processing failed: {0}")]
    Processing(String),

    /// A processing function panicked; the panic payload is preserved
    #[error("processing function panicked: {0}")]
    Panic(String),

    /// A user callback returned an error
    #[error("callback failed: {0}")]
    Callback(String),

    /// The executor was cancelled, either by its caller or by a failure
    /// elsewhere in the chain
    #[error("executor cancelled")]
    Cancelled,

    /// The output queue was closed from the consuming side while a worker
    /// was still producing into it
    #[error("output queue closed")]
    OutputClosed,
}

impl Error {
    /// Whether this error represents a cancellation rather than a failure.
    ///
    /// Cancellations are subordinate to real errors during exit handling:
    /// a routine that observes its token cancelled exits through the
    /// cancellation path even if the processing function also failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
