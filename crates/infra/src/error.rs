//! Queue operation errors.

use relq_core::CodecError;

use crate::store::StoreError;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No connection with this name is configured. Not retried.
    #[error("queue connection {0} not found")]
    UnknownConnection(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The store answered but reported nothing written.
    #[error("store did not acknowledge write to {key}")]
    NotAcknowledged { key: String },

    #[error("queue connection {0} is closed")]
    Closed(String),

    /// A blocking pop is already outstanding on this connection.
    #[error("a poll is already in flight")]
    PollInFlight,
}
