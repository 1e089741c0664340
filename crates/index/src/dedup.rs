//! Existence filter used while bulk loading.
//!
//! In indexing mode the backing tables have no unique keys, so every insert
//! is first checked against this filter. It is an in-memory mirror of the
//! table's `(primary, secondary)` keys, sharded the same way as the hash
//! table and packed tightly: one bulk load can hold hundreds of millions of
//! keys.

use crate::error::{ErrorKind, Result};
use crate::hash::ContentHash;
use crate::hashstore::ROW_SLOTS_MAX;
use crate::shard::ShardDirectory;
use derive_more::Display;
use exn::ResultExt;
use refindex_store::Cursor;
use tracing::instrument;

/// A residual sharing its row with this many others is treated as already
/// present. Keys that collide this heavily are almost always the same
/// boilerplate repeated across documents.
pub const FANOUT_LIMIT: usize = 20;

const RESIDUAL_BYTES: usize = 5;
const COMPACT_SECONDARY_MASK: u64 = (1 << 40) - 1;

/// How many bits of the secondary key a filter keeps.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Packing {
    /// Low 40 bits of the secondary key (10 bytes per slot).
    ///
    /// Two secondaries agreeing in those bits are one key here, so a bulk
    /// load drops the second while a normal-mode insert would store both.
    #[display("compact")]
    Compact,
    /// The full 64-bit secondary key (13 bytes per slot).
    #[display("wide")]
    Wide,
}

impl Packing {
    pub const fn width(self) -> usize {
        match self {
            Self::Compact => RESIDUAL_BYTES + 5,
            Self::Wide => RESIDUAL_BYTES + 8,
        }
    }

    fn secondary(self, secondary: u64) -> u64 {
        match self {
            Self::Compact => secondary & COMPACT_SECONDARY_MASK,
            Self::Wide => secondary,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Inserted,
    /// The key is present, or its residual has hit [`FANOUT_LIMIT`].
    Duplicate,
    /// The shard row is at capacity; nothing was recorded.
    Full,
}

fn read_le(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
}

pub struct DedupFilter {
    packing: Packing,
    rows: ShardDirectory<Vec<u8>>,
    len: usize,
}

impl DedupFilter {
    pub fn new(packing: Packing) -> Self {
        Self { packing, rows: ShardDirectory::new(), len: 0 }
    }

    pub fn packing(&self) -> Packing {
        self.packing
    }

    /// Number of keys recorded.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn check_and_insert(&mut self, hash: ContentHash, secondary: u64) -> Verdict {
        let width = self.packing.width();
        let residual = hash.residual();
        let secondary = self.packing.secondary(secondary);
        let row = self.rows.get_or_default(hash.shard());

        let mut fanout = 0;
        for slot in row.chunks_exact(width) {
            if read_le(&slot[..RESIDUAL_BYTES]) != residual {
                continue;
            }
            if read_le(&slot[RESIDUAL_BYTES..]) == secondary {
                return Verdict::Duplicate;
            }
            fanout += 1;
        }
        if fanout >= FANOUT_LIMIT {
            return Verdict::Duplicate;
        }
        if row.len() / width >= ROW_SLOTS_MAX {
            return Verdict::Full;
        }

        row.extend_from_slice(&residual.to_le_bytes()[..RESIDUAL_BYTES]);
        row.extend_from_slice(&secondary.to_le_bytes()[..width - RESIDUAL_BYTES]);
        self.len += 1;
        Verdict::Inserted
    }

    /// Forget a key recorded by [`check_and_insert`](Self::check_and_insert)
    /// whose row never reached the backing table.
    ///
    /// Returns `false` if the key was not recorded.
    pub fn remove(&mut self, hash: ContentHash, secondary: u64) -> bool {
        let width = self.packing.width();
        let residual = hash.residual();
        let secondary = self.packing.secondary(secondary);
        let Some(row) = self.rows.get_mut(hash.shard()) else {
            return false;
        };
        let Some(at) = row.chunks_exact(width).rposition(|slot| {
            read_le(&slot[..RESIDUAL_BYTES]) == residual && read_le(&slot[RESIDUAL_BYTES..]) == secondary
        }) else {
            return false;
        };
        row.drain(at * width..(at + 1) * width);
        self.len -= 1;
        true
    }

    /// Replay every key of a backing table through the filter.
    ///
    /// Returns the number of keys recorded.
    #[instrument(skip_all, fields(packing = %self.packing))]
    pub async fn rebuild(&mut self, mut keys: Cursor<(u64, u64)>) -> Result<usize> {
        let before = self.len;
        let mut rejected = 0usize;
        while let Some(key) = keys.next().await {
            let (primary, secondary) = key.or_raise(|| ErrorKind::Store)?;
            if self.check_and_insert(ContentHash::new(primary), secondary) != Verdict::Inserted {
                rejected += 1;
            }
        }
        let recorded = self.len - before;
        tracing::info!(recorded, rejected, "Dedup filter rebuilt");
        Ok(recorded)
    }
}
