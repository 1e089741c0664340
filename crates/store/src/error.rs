//! Store Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The database file could not be created or opened (bad path, missing
    /// permissions, not a directory).
    #[display("cannot open store at {}", _0.display())]
    Configuration(#[error(not(source))] PathBuf),
    /// The on-disk layout does not match what this build expects.
    #[display("unexpected on-disk schema")]
    Schema,
    /// A read, write or commit against the backing database failed.
    #[display("database error")]
    Database,
    /// A value could not be converted to or from its column representation.
    #[display("invalid data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::Database, true)]
    #[case(ErrorKind::Schema, false)]
    #[case(ErrorKind::InvalidData("shard id"), false)]
    #[case(ErrorKind::Configuration(PathBuf::from("/nope")), false)]
    fn test_retryable(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ErrorKind::Configuration(PathBuf::from("/var/lib/refindex")).to_string(),
            "cannot open store at /var/lib/refindex"
        );
        assert_eq!(ErrorKind::InvalidData("slot count").to_string(), "invalid data: slot count");
    }
}
