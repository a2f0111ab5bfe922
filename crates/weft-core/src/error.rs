//! Error types for the weft engine.
//!
//! Missing dependencies are deliberately *not* represented here: a remote
//! operation whose prerequisites have not arrived yet is the common case and
//! is handled by the dependency scheduler, never reported as a failure.

use crate::op::OpId;
use thiserror::Error;

/// Result type for weft engine operations.
pub type Result<T> = std::result::Result<T, WeftError>;

/// Errors that can occur inside the weft engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WeftError {
    /// A binary message carried a structure tag the decoder does not know.
    /// Fatal to that single message only; the engine drops it and continues.
    #[error("unknown structure tag: {0}")]
    UnknownTag(u8),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An id range of zero length was requested.
    #[error("requested an id range without a count")]
    EmptyIdRange,

    /// Client id 0 is reserved for pre-shared root containers and must not
    /// be used as a replica identity.
    #[error("client id 0 is reserved for shared roots")]
    ReservedClient,

    /// A positional mutation addressed a position past the end of its
    /// container.
    #[error("position {0} out of bounds")]
    OutOfBounds(u64),

    /// A linked record that the store invariants guarantee to exist could
    /// not be resolved. Indicates a corrupted operation store.
    #[error("operation store corrupted: missing record {0:?}")]
    MissingRecord(OpId),

    #[error("operation store corrupted: {0}")]
    Corrupt(String),

    /// The engine task is no longer running.
    #[error("engine has shut down")]
    EngineClosed,
}
