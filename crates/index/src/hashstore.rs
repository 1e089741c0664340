//! The serving-time hash table.
//!
//! Every shard of the 24-bit domain owns a row of fixed-size [`Slot`]s split
//! into a primary and a derived section. The whole table is loaded into memory
//! at startup, grows in place, and is written back one dirty row at a time.

use crate::error::{ErrorKind, Result};
use crate::hash::{ContentHash, SHARD_COUNT};
use crate::shard::ShardDirectory;
use crate::slot::{SLOT_BYTES, Section, Slot, SlotFields, SlotMatch, SlotRef};
use exn::{OptionExt, ResultExt};
use refindex_store::{ShardRecord, ShardTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::instrument;

/// Most slots a single shard row may hold, across both sections.
pub const ROW_SLOTS_MAX: usize = 16_384;

#[derive(Default)]
struct ShardRow {
    primary: Vec<Slot>,
    derived: Vec<Slot>,
    /// Set on append, cleared once the row is durably saved.
    dirty: AtomicBool,
}

impl ShardRow {
    fn len(&self) -> usize {
        self.primary.len() + self.derived.len()
    }

    fn section(&self, section: Section) -> &[Slot] {
        match section {
            Section::Primary => &self.primary,
            Section::Derived => &self.derived,
        }
    }

    fn matches(&self, shard: u32, section: Section) -> impl Iterator<Item = SlotMatch> + '_ {
        self.section(section).iter().enumerate().map(move |(index, slot)| SlotMatch {
            // A row never holds more than ROW_SLOTS_MAX slots.
            at: SlotRef { shard, section, index: index as u32 },
            slot: *slot,
        })
    }

    fn to_record(&self, shard: u32) -> ShardRecord {
        let mut slots = Vec::with_capacity(self.len() * SLOT_BYTES);
        for slot in self.primary.iter().chain(&self.derived) {
            slots.extend_from_slice(&slot.to_bytes());
        }
        ShardRecord {
            shard_id: i64::from(shard),
            primary_count: self.primary.len() as i64,
            derived_count: self.derived.len() as i64,
            slots,
        }
    }
}

/// Result of [`HashStore::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// A new slot was appended with a fresh sequence id.
    Appended(SlotMatch),
    /// An identical slot was already present.
    Existing(SlotMatch),
    /// The row is at [`ROW_SLOTS_MAX`]; nothing was changed.
    Full,
}

pub struct HashStore {
    rows: ShardDirectory<ShardRow>,
    /// Shards whose `dirty` flag is set, in the order they were dirtied.
    dirty: Mutex<Vec<u32>>,
    next_seq: u64,
    populated: usize,
    slots: usize,
}

impl Default for HashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HashStore {
    pub fn new() -> Self {
        Self { rows: ShardDirectory::new(), dirty: Mutex::new(Vec::new()), next_seq: 1, populated: 0, slots: 0 }
    }

    /// Materialize every persisted row.
    #[instrument(skip_all)]
    pub async fn load(shards: &ShardTable) -> Result<Self> {
        let mut store = Self::new();
        let mut cursor = shards.scan();
        while let Some(record) = cursor.next().await {
            store.restore(record.or_raise(|| ErrorKind::Store)?)?;
        }
        tracing::info!(shards = store.populated, slots = store.slots, next_seq = store.next_seq, "Hash table loaded");
        Ok(store)
    }

    fn restore(&mut self, record: ShardRecord) -> Result<()> {
        let shard = u32::try_from(record.shard_id)
            .ok()
            .filter(|shard| (*shard as usize) < SHARD_COUNT)
            .ok_or_raise(|| ErrorKind::Schema(record.shard_id))?;
        let corrupt = |reason| ErrorKind::Corruption { shard, reason };
        let primary = usize::try_from(record.primary_count).or_raise(|| corrupt("negative primary count"))?;
        let derived = usize::try_from(record.derived_count).or_raise(|| corrupt("negative derived count"))?;
        let total = primary + derived;
        if total > ROW_SLOTS_MAX {
            exn::bail!(corrupt("too many slots"));
        }
        let (chunks, remainder) = record.slots.as_chunks::<SLOT_BYTES>();
        if chunks.len() != total || !remainder.is_empty() {
            exn::bail!(corrupt("slot blob length does not match counts"));
        }
        if total == 0 {
            return Ok(());
        }

        let decoded: Vec<Slot> = chunks.iter().map(Slot::from_bytes).collect();
        if let Some(max) = decoded.iter().map(|slot| slot.seq).max() {
            self.next_seq = self.next_seq.max(u64::from(max) + 1);
        }
        let row = self.rows.get_or_default(shard);
        if row.len() == 0 {
            self.populated += 1;
        }
        self.slots = self.slots - row.len() + total;
        row.derived = decoded[primary..].to_vec();
        row.primary = decoded;
        row.primary.truncate(primary);
        Ok(())
    }

    /// Copies of every slot in the hash's row whose residual matches, and
    /// whose tag matches too when one is given. Primary slots come first.
    pub fn lookup(&self, hash: ContentHash, tag: Option<u8>) -> Vec<SlotMatch> {
        let shard = hash.shard();
        let Some(row) = self.rows.get(shard) else {
            return Vec::new();
        };
        let residual = hash.residual();
        row.matches(shard, Section::Primary)
            .chain(row.matches(shard, Section::Derived))
            .filter(|found| found.slot.residual == residual && tag.is_none_or(|tag| found.slot.tag == tag))
            .collect()
    }

    /// The slot a [`SlotRef`] points at, if any.
    pub fn get(&self, at: SlotRef) -> Option<Slot> {
        self.rows.get(at.shard)?.section(at.section).get(at.index as usize).copied()
    }

    pub fn insert(&mut self, hash: ContentHash, fields: SlotFields) -> Result<Placement> {
        let shard = hash.shard();
        let residual = hash.residual();
        let row = self.rows.get_or_default(shard);

        if let Some(existing) = row.matches(shard, fields.section).find(|found| found.slot.is(residual, &fields)) {
            return Ok(Placement::Existing(existing));
        }
        if row.len() >= ROW_SLOTS_MAX {
            return Ok(Placement::Full);
        }
        let seq = u32::try_from(self.next_seq).or_raise(|| ErrorKind::Capacity)?;

        if row.len() == 0 {
            self.populated += 1;
        }
        let slot = Slot { residual, tag: fields.tag, aux: fields.aux, seq };
        let section = match fields.section {
            Section::Primary => &mut row.primary,
            Section::Derived => &mut row.derived,
        };
        let index = section.len() as u32;
        section.push(slot);
        if !row.dirty.swap(true, Ordering::AcqRel) {
            self.dirty.get_mut().unwrap_or_else(PoisonError::into_inner).push(shard);
        }
        self.next_seq += 1;
        self.slots += 1;
        Ok(Placement::Appended(SlotMatch { at: SlotRef { shard, section: fields.section, index }, slot }))
    }

    /// Write every dirty row and commit. Dirty flags are cleared only once
    /// the commit succeeds; on failure the same rows are written next time.
    ///
    /// Returns the number of rows saved.
    #[instrument(skip_all)]
    pub async fn save(&self, shards: &ShardTable) -> Result<usize> {
        let dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if dirty.is_empty() {
            return Ok(0);
        }
        let records: Vec<ShardRecord> =
            dirty.iter().filter_map(|shard| self.rows.get(*shard).map(|row| row.to_record(*shard))).collect();
        shards.save(&records).await.or_raise(|| ErrorKind::Store)?;

        // Appends need `&mut self`, so nothing was dirtied while saving.
        let mut list = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
        for shard in list.drain(..) {
            if let Some(row) = self.rows.get(shard) {
                row.dirty.store(false, Ordering::Release);
            }
        }
        tracing::debug!(rows = records.len(), "Hash table saved");
        Ok(records.len())
    }

    /// Shards holding at least one slot.
    pub fn populated(&self) -> usize {
        self.populated
    }

    pub fn len(&self) -> usize {
        self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }

    /// Rows changed since the last successful save.
    pub fn dirty_rows(&self) -> usize {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The sequence id the next appended slot will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}
