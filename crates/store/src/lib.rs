//! SQLite persistence layer for the refindex hash index.
//!
//! Every logical relation lives in its own SQLite database file inside the
//! index directory, so that each one has an independent write lock and can be
//! committed on its own schedule.
//!
//! # Architecture
//! Each relation owns two channels over the same database file:
//! - **Write channel**: a single dedicated connection that keeps one long
//!   transaction open. All inserts go through it, and [`Store::commit_all`]
//!   (or a relation's own `commit`) is the durability boundary.
//! - **Read channel**: a small read-only connection pool used for point
//!   lookups and [`Cursor`]s. Reads succeed while the write transaction is
//!   open, and only ever observe committed rows.
//!
//! # Modes
//! - [`Mode::Normal`]: WAL journaling, full synchronous durability, unique
//!   indexes present, inserts are insert-or-ignore.
//! - [`Mode::Indexing`]: relaxed journaling and syncing, unique indexes
//!   dropped, plain inserts. Callers are expected to deduplicate before
//!   inserting and to call [`Store::finish`] once loading is done.

mod associations;
mod cursor;
mod db;
pub mod error;
mod payloads;
mod shards;
mod store;

pub use crate::associations::AssociationTable;
pub use crate::cursor::Cursor;
pub use crate::payloads::PayloadTable;
pub use crate::shards::{ShardRecord, ShardTable};
pub use crate::store::Store;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// How the store is initialized for this process.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Live serving: durable, idempotent inserts.
    #[default]
    #[display("normal")]
    Normal,
    /// One-shot bulk (re)ingestion: fast, not crash safe, deduplicated by the caller.
    #[display("indexing")]
    Indexing,
}

/// Connection tuning shared by every relation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Options {
    /// How long a connection waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
    /// Size of each relation's read-only connection pool.
    pub read_connections: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            // A save cycle checkpointing a large WAL can hold readers back for
            // a while; anything below a second or so surfaces SQLITE_BUSY.
            busy_timeout_ms: 1500,
            read_connections: 4,
        }
    }
}

/// Hashes are stored bit-for-bit in SQLite's signed INTEGER column type.
pub(crate) fn to_sql(hash: u64) -> i64 {
    i64::from_ne_bytes(hash.to_ne_bytes())
}

pub(crate) fn from_sql(value: i64) -> u64 {
    u64::from_ne_bytes(value.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(u64::MAX)]
    #[case(0x8000_0000_0000_0000)]
    #[case(0x0123_4567_89ab_cdef)]
    fn test_hash_column_is_lossless(#[case] hash: u64) {
        assert_eq!(from_sql(to_sql(hash)), hash);
    }

    #[test]
    fn test_high_bit_hashes_are_negative() {
        assert!(to_sql(u64::MAX) < 0);
        assert_eq!(to_sql(u64::MAX), -1);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(Mode::Normal.to_string(), "normal");
        assert_eq!(Mode::Indexing.to_string(), "indexing");
        assert_eq!(Mode::default(), Mode::Normal);
    }
}
