//! Error model shared by producers and consumers.

use thiserror::Error;

/// Result type returned by queue handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Whether a handler failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Counted against `max_attempts` and re-queued until exhausted.
    Retryable,
    /// Dead-lettered immediately, regardless of the attempt count.
    Unretryable,
}

/// Failure returned by a queue handler.
///
/// Handlers signal failure uniformly through this value; the discriminant
/// decides whether the retry policy applies at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    kind: FailureKind,
    message: String,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn unretryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unretryable,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Package (de)serialization failure.
///
/// A decode failure is transport corruption, not a processing error: no
/// queue or handler can be determined for such bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed package: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("package could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}
