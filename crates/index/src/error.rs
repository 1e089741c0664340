//! Index Error Types

use derive_more::{Display, Error};
use refindex_store::Mode;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The backing store failed; the underlying store error is attached.
    #[display("storage operation failed")]
    Store,
    /// A persisted shard row has an id outside the 24-bit shard domain.
    #[display("shard id {_0} is outside the hash domain")]
    Schema(#[error(not(source))] i64),
    /// A persisted shard row cannot be decoded.
    #[display("shard {shard} is corrupt: {reason}")]
    Corruption { shard: u32, reason: &'static str },
    /// Sequence ids are exhausted.
    #[display("sequence ids exhausted")]
    Capacity,
    #[display("unknown association relation: {_0}")]
    UnknownRelation(#[error(not(source))] String),
    /// The operation is only meaningful in another store mode.
    #[display("operation not available in {_0} mode")]
    WrongMode(#[error(not(source))] Mode),
    /// The index has been shut down.
    #[display("index is closed")]
    Closed,
    #[display("invalid content hash: {_0:?}")]
    InvalidHash(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store)
    }
}
