//! Content-addressable hash index.
//!
//! Callers hand in 64-bit content hashes (produced elsewhere from normalized
//! text) and byte payloads; the index answers exact-hash lookups.
//!
//! - [`HashStore`]: the serving table, 2^24 shard rows of fixed-size slots,
//!   held fully in memory and saved incrementally.
//! - [`DedupFilter`]: keeps bulk loads free of duplicate keys while the
//!   backing tables have no unique indexes.
//! - [`Index`]: ties both to a [`refindex_store::Store`] behind the data and
//!   saver locks.
//! - [`Saver`]: commits and saves in the background.

mod dedup;
mod engine;
pub mod error;
mod hash;
mod hashstore;
mod saver;
mod shard;
mod slot;

pub use crate::dedup::{DedupFilter, FANOUT_LIMIT, Packing, Verdict};
pub use crate::engine::{Index, Outcome, SaveReport, Stats};
pub use crate::hash::{ContentHash, RESIDUAL_BITS, SHARD_BITS, SHARD_COUNT, dedup_hash};
pub use crate::hashstore::{HashStore, Placement, ROW_SLOTS_MAX};
pub use crate::saver::Saver;
pub use crate::slot::{SLOT_BYTES, Section, Slot, SlotFields, SlotMatch, SlotRef};
pub use refindex_config::{Config, SaverConfig};
pub use refindex_store::{Cursor, Mode};
