//! The index context: every structure of one index directory behind the
//! data and saver locks.
//!
//! # Locking
//! - The data lock guards the hash table, the dedup filters and the store.
//!   Lookups take it shared, inserts take it exclusive.
//! - The saver lock serializes save sequences with each other and with
//!   shutdown. A save holds it exclusively, then holds the data lock shared,
//!   so lookups keep being served while a save is in progress.

use crate::dedup::{DedupFilter, Packing, Verdict};
use crate::error::{ErrorKind, Result};
use crate::hash::{ContentHash, dedup_hash};
use crate::hashstore::{HashStore, Placement};
use crate::slot::{SlotFields, SlotMatch};
use exn::{OptionExt, ResultExt};
use refindex_config::{Config, SaverConfig};
use refindex_store::{Cursor, Mode, Store};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockMappedWriteGuard, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;
use tracing::instrument;

/// Result of an insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome<T = ()> {
    Inserted(T),
    /// Already present (or, while bulk loading, treated as present).
    Duplicate(T),
    /// The target shard row is at capacity; nothing was stored.
    Full,
}

impl<T> Outcome<T> {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Payload, association and shard rows made durable by the commit.
    pub rows_committed: u64,
    /// Hash table rows written back.
    pub shards_saved: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    pub mode: Mode,
    pub populated_shards: usize,
    pub slots: usize,
    pub dirty_rows: usize,
    pub next_seq: u64,
    /// Committed payload rows.
    pub payloads: u64,
    /// Uncommitted rows per table.
    pub pending: Vec<(String, u64)>,
    /// Successful inserts since the last save.
    pub unsaved: u64,
}

/// When the index last changed, and how much has changed since it was saved.
struct Activity {
    epoch: Instant,
    last_write_ms: AtomicU64,
    unsaved: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self { epoch: Instant::now(), last_write_ms: AtomicU64::new(0), unsaved: AtomicU64::new(0) }
    }

    fn record(&self) {
        let now = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_write_ms.store(now, Ordering::Release);
        self.unsaved.fetch_add(1, Ordering::AcqRel);
    }

    fn idle(&self) -> Duration {
        self.epoch.elapsed().saturating_sub(Duration::from_millis(self.last_write_ms.load(Ordering::Acquire)))
    }

    fn unsaved(&self) -> u64 {
        self.unsaved.load(Ordering::Acquire)
    }

    fn saved(&self, count: u64) {
        self.unsaved.fetch_sub(count, Ordering::AcqRel);
    }
}

/// Bulk-mode existence filters, one per backing relation.
struct Filters {
    payloads: DedupFilter,
    associations: HashMap<String, DedupFilter>,
    /// The store's rollback count when the filters were built.
    generation: u64,
}

impl Filters {
    async fn rebuild(store: &Store) -> Result<Self> {
        let generation = store.rollbacks();
        let mut payloads = DedupFilter::new(Packing::Wide);
        payloads.rebuild(store.payloads().keys()).await?;
        let mut associations = HashMap::new();
        for table in store.associations() {
            let mut filter = DedupFilter::new(Packing::Compact);
            filter.rebuild(table.keys()).await?;
            associations.insert(table.relation().to_string(), filter);
        }
        Ok(Self { payloads, associations, generation })
    }
}

struct State {
    store: Store,
    hashes: HashStore,
    /// Present only in [`Mode::Indexing`].
    filters: Option<Filters>,
}

impl State {
    /// The bulk-mode filters, rebuilt from the committed rows first if a
    /// failed commit has thrown away keys they still hold.
    async fn filters(&mut self) -> Result<Option<&mut Filters>> {
        let Some(filters) = self.filters.as_mut() else {
            return Ok(None);
        };
        let rollbacks = self.store.rollbacks();
        if filters.generation != rollbacks {
            tracing::warn!(rollbacks, "Uncommitted rows were rolled back; rebuilding dedup filters");
            *filters = Filters::rebuild(&self.store).await?;
        }
        Ok(Some(filters))
    }
}

pub struct Index {
    directory: PathBuf,
    mode: Mode,
    data: RwLock<Option<State>>,
    save_lock: RwLock<()>,
    activity: Activity,
}

impl Index {
    /// Open the index in `directory` with default settings and no
    /// association relations.
    pub async fn init(directory: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        Self::open(&Config { directory: directory.as_ref().to_path_buf(), mode, ..Config::default() }).await
    }

    /// Open the store, load the hash table and, in indexing mode, rebuild
    /// the dedup filters from what is already stored.
    #[instrument(skip(config), fields(directory = %config.directory.display(), mode = %config.mode))]
    pub async fn open(config: &Config) -> Result<Self> {
        let store = Store::open(&config.directory, config.mode, &config.store, &config.associations)
            .await
            .or_raise(|| ErrorKind::Store)?;
        let (hashes, filters) = match Self::materialize(&store).await {
            Ok(loaded) => loaded,
            Err(err) => {
                if let Err(close_err) = store.close().await {
                    tracing::warn!(error = ?close_err, "Failed to close store after a failed open");
                }
                return Err(err);
            },
        };
        tracing::info!(shards = hashes.populated(), slots = hashes.len(), "Index opened");
        Ok(Self {
            directory: config.directory.clone(),
            mode: config.mode,
            data: RwLock::new(Some(State { store, hashes, filters })),
            save_lock: RwLock::new(()),
            activity: Activity::new(),
        })
    }

    async fn materialize(store: &Store) -> Result<(HashStore, Option<Filters>)> {
        let hashes = HashStore::load(store.shards()).await?;
        let filters = match store.mode() {
            Mode::Indexing => Some(Filters::rebuild(store).await?),
            Mode::Normal => None,
        };
        Ok((hashes, filters))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    async fn state(&self) -> Result<RwLockReadGuard<'_, State>> {
        RwLockReadGuard::try_map(self.data.read().await, |data| data.as_ref()).ok().ok_or_raise(|| ErrorKind::Closed)
    }

    async fn state_mut(&self) -> Result<RwLockMappedWriteGuard<'_, State>> {
        RwLockWriteGuard::try_map(self.data.write().await, |data| data.as_mut()).ok().ok_or_raise(|| ErrorKind::Closed)
    }

    fn outcome<T>(&self, inserted: bool, value: T) -> Outcome<T> {
        if inserted {
            self.activity.record();
            Outcome::Inserted(value)
        } else {
            Outcome::Duplicate(value)
        }
    }

    /// Store a payload under its primary hash.
    pub async fn insert(&self, primary: ContentHash, payload: &[u8]) -> Result<Outcome> {
        let dedup = dedup_hash(payload);
        let mut guard = self.state_mut().await?;
        let state = &mut *guard;
        if let Some(filters) = state.filters().await? {
            match filters.payloads.check_and_insert(primary, dedup) {
                Verdict::Inserted => {},
                Verdict::Duplicate => return Ok(Outcome::Duplicate(())),
                Verdict::Full => return Ok(Outcome::Full),
            }
        }
        match state.store.payloads().insert(primary.get(), dedup, payload).await {
            Ok(inserted) => Ok(self.outcome(inserted, ())),
            Err(err) => {
                tracing::error!(hash = %primary, error = ?err, "Payload insert failed");
                // The row was never written, so a retry must not be a duplicate.
                if let Some(filters) = state.filters.as_mut() {
                    filters.payloads.remove(primary, dedup);
                }
                Err(err).or_raise(|| ErrorKind::Store)
            },
        }
    }

    /// Record an edge in a named association relation.
    pub async fn insert_association(&self, relation: &str, left: ContentHash, right: ContentHash) -> Result<Outcome> {
        let mut guard = self.state_mut().await?;
        let state = &mut *guard;
        if let Some(filter) = state.filters().await?.and_then(|filters| filters.associations.get_mut(relation)) {
            match filter.check_and_insert(left, right.get()) {
                Verdict::Inserted => {},
                Verdict::Duplicate => return Ok(Outcome::Duplicate(())),
                Verdict::Full => return Ok(Outcome::Full),
            }
        }
        let table = state.store.association(relation).ok_or_raise(|| ErrorKind::UnknownRelation(relation.to_string()))?;
        match table.insert(left.get(), right.get()).await {
            Ok(inserted) => Ok(self.outcome(inserted, ())),
            Err(err) => {
                tracing::error!(relation, %left, %right, error = ?err, "Association insert failed");
                if let Some(filter) = state.filters.as_mut().and_then(|filters| filters.associations.get_mut(relation)) {
                    filter.remove(left, right.get());
                }
                Err(err).or_raise(|| ErrorKind::Store)
            },
        }
    }

    /// Add a slot to the hash table. An identical slot is returned as a
    /// duplicate together with its original sequence id.
    pub async fn insert_slot(&self, hash: ContentHash, fields: SlotFields) -> Result<Outcome<SlotMatch>> {
        let mut state = self.state_mut().await?;
        Ok(match state.hashes.insert(hash, fields)? {
            Placement::Appended(found) => self.outcome(true, found),
            Placement::Existing(found) => Outcome::Duplicate(found),
            Placement::Full => Outcome::Full,
        })
    }

    pub async fn lookup_slots(&self, hash: ContentHash, tag: Option<u8>) -> Result<Vec<SlotMatch>> {
        Ok(self.state().await?.hashes.lookup(hash, tag))
    }

    /// Committed payloads stored under `primary`.
    ///
    /// The cursor reads on its own connection and stays usable after the
    /// data lock is released.
    pub async fn open_cursor(&self, primary: ContentHash) -> Result<Cursor<Vec<u8>>> {
        Ok(self.state().await?.store.payloads().open_cursor(primary.get()))
    }

    /// Committed right-hand hashes associated with `left`.
    pub async fn lookup_association(&self, relation: &str, left: ContentHash) -> Result<Vec<ContentHash>> {
        let state = self.state().await?;
        let table = state.store.association(relation).ok_or_raise(|| ErrorKind::UnknownRelation(relation.to_string()))?;
        let rights = table.lookup(left.get()).await.or_raise(|| ErrorKind::Store)?;
        Ok(rights.into_iter().map(ContentHash::new).collect())
    }

    /// Commit every table and write back the dirty hash table rows.
    #[instrument(skip(self))]
    pub async fn save_all(&self) -> Result<SaveReport> {
        let _saving = self.save_lock.write().await;
        let state = self.state().await?;
        self.flush(&state).await
    }

    /// Save if there is unsaved work and either the index has been idle for
    /// long enough or enough work has piled up. Returns `None` when nothing
    /// was due.
    pub(crate) async fn save_if_due(&self, config: &SaverConfig) -> Result<Option<SaveReport>> {
        let _saving = self.save_lock.write().await;
        let state = self.state().await?;
        let unsaved = self.activity.unsaved();
        if unsaved == 0 {
            return Ok(None);
        }
        let idle = self.activity.idle();
        let pressure = state.store.max_pending().max(state.hashes.dirty_rows() as u64);
        if idle < config.idle() && pressure < config.pending_threshold {
            tracing::trace!(unsaved, idle_ms = idle.as_millis(), pressure, "Save not due");
            return Ok(None);
        }
        tracing::debug!(unsaved, idle_ms = idle.as_millis(), pressure, "Save due");
        self.flush(&state).await.map(Some)
    }

    async fn flush(&self, state: &State) -> Result<SaveReport> {
        let unsaved = self.activity.unsaved();
        let rows_committed = state.store.commit_all().await.or_raise(|| ErrorKind::Store)?;
        let shards_saved = state.hashes.save(state.store.shards()).await?;
        self.activity.saved(unsaved);
        tracing::info!(rows_committed, shards_saved, "Index saved");
        Ok(SaveReport { rows_committed, shards_saved })
    }

    /// End a bulk load: save everything and build the unique keys.
    #[instrument(skip(self))]
    pub async fn finish(&self) -> Result<SaveReport> {
        if self.mode != Mode::Indexing {
            exn::bail!(ErrorKind::WrongMode(self.mode));
        }
        let _saving = self.save_lock.write().await;
        let state = self.state_mut().await?;
        let report = self.flush(&state).await?;
        state.store.finish().await.or_raise(|| ErrorKind::Store)?;
        Ok(report)
    }

    /// Final flush and close. Every later call fails with
    /// [`ErrorKind::Closed`]; calling this again does nothing.
    ///
    /// A failed flush does not stop the store from being closed; the flush
    /// error is returned afterwards.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let _saving = self.save_lock.write().await;
        let Some(state) = self.data.write().await.take() else {
            tracing::debug!("Index already closed");
            return Ok(());
        };
        let flushed = self.flush(&state).await;
        if let Err(err) = &flushed {
            tracing::error!(error = ?err, "Final flush failed; unsaved changes are lost");
        }
        let closed = state.store.close().await.or_raise(|| ErrorKind::Store);
        if let Err(err) = &closed {
            tracing::error!(error = ?err, "Failed to close store");
        }
        tracing::info!("Index shut down");
        flushed.and(closed)
    }

    pub async fn stats(&self) -> Result<Stats> {
        let state = self.state().await?;
        Ok(Stats {
            mode: self.mode,
            populated_shards: state.hashes.populated(),
            slots: state.hashes.len(),
            dirty_rows: state.hashes.dirty_rows(),
            next_seq: state.hashes.next_seq(),
            payloads: state.store.payloads().count().await.or_raise(|| ErrorKind::Store)?,
            pending: state.store.pending(),
            unsaved: self.activity.unsaved(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Section;
    use refindex_store::Options;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::{ConnectOptions, SqliteConnection};
    use std::sync::Arc;

    const PRIMARY: SlotFields = SlotFields { section: Section::Primary, tag: 11, aux: 0 };

    fn config(dir: &Path, mode: Mode) -> Config {
        Config { directory: dir.to_path_buf(), mode, associations: vec!["cites".to_string()], ..Config::default() }
    }

    /// A bulk-mode index that gives up quickly on a locked file.
    fn impatient(dir: &Path) -> Config {
        Config { store: Options { busy_timeout_ms: 50, ..Options::default() }, ..config(dir, Mode::Indexing) }
    }

    /// A second connection to one of the index's files.
    async fn intruder(dir: &Path, file: &str) -> SqliteConnection {
        SqliteConnectOptions::new().filename(dir.join(file)).connect().await.unwrap()
    }

    async fn payloads(index: &Index, hash: ContentHash) -> Vec<Vec<u8>> {
        index.open_cursor(hash).await.unwrap().try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_hello_world() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::init(temp_dir.path(), Mode::Normal).await.unwrap();
        let h1 = ContentHash::from_parts(0x00_abcd, 0x12_3456_7890);
        let h2 = ContentHash::from_parts(0x00_abcd, 0x12_3456_7891);

        assert_eq!(index.insert(h1, b"Hello World").await.unwrap(), Outcome::Inserted(()));
        let Outcome::Inserted(slot) = index.insert_slot(h1, PRIMARY).await.unwrap() else {
            panic!("slot was not inserted");
        };
        index.save_all().await.unwrap();

        assert_eq!(index.lookup_slots(h1, None).await.unwrap(), vec![slot]);
        assert_eq!(index.lookup_slots(h1, Some(11)).await.unwrap(), vec![slot]);
        assert!(index.lookup_slots(h1, Some(12)).await.unwrap().is_empty());
        assert_eq!(payloads(&index, h1).await, vec![b"Hello World".to_vec()]);

        assert!(index.lookup_slots(h2, None).await.unwrap().is_empty());
        assert!(payloads(&index, h2).await.is_empty());
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_inserts_are_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::open(&config(temp_dir.path(), Mode::Normal)).await.unwrap();
        let hash = ContentHash::new(0x0bad_cafe_0000_0001);

        assert_eq!(index.insert(hash, b"payload").await.unwrap(), Outcome::Inserted(()));
        assert_eq!(index.insert(hash, b"payload").await.unwrap(), Outcome::Duplicate(()));
        assert_eq!(index.insert(hash, b"other").await.unwrap(), Outcome::Inserted(()));

        let first = index.insert_slot(hash, PRIMARY).await.unwrap();
        let Outcome::Inserted(found) = first else { panic!("slot was not inserted") };
        assert_eq!(index.insert_slot(hash, PRIMARY).await.unwrap(), Outcome::Duplicate(found));

        let right = ContentHash::new(7);
        assert!(index.insert_association("cites", hash, right).await.unwrap().is_inserted());
        assert_eq!(index.insert_association("cites", hash, right).await.unwrap(), Outcome::Duplicate(()));
        index.save_all().await.unwrap();

        assert_eq!(index.stats().await.unwrap().payloads, 2);
        assert_eq!(index.lookup_association("cites", hash).await.unwrap(), vec![right]);
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_relation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::open(&config(temp_dir.path(), Mode::Normal)).await.unwrap();
        let err = index.insert_association("nope", ContentHash::new(1), ContentHash::new(2)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownRelation(name) if name == "nope"));
        let err = index.lookup_association("nope", ContentHash::new(1)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownRelation(_)));
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bulk_load_persists_each_distinct_payload_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::open(&config(temp_dir.path(), Mode::Indexing)).await.unwrap();
        let distinct = 40u64;
        let mut inserted = 0;
        for round in 0..3 {
            for n in 0..distinct {
                let hash = ContentHash::new(n.wrapping_mul(0x9e37_79b9_7f4a_7c15));
                let outcome = index.insert(hash, format!("payload {n}").as_bytes()).await.unwrap();
                if outcome.is_inserted() {
                    inserted += 1;
                } else {
                    assert_eq!(outcome, Outcome::Duplicate(()), "round {round}");
                }
            }
        }
        assert_eq!(inserted, distinct);
        index.finish().await.unwrap();
        index.shutdown().await.unwrap();

        // Reopening in bulk mode rebuilds the filter from what was stored.
        let index = Index::open(&config(temp_dir.path(), Mode::Indexing)).await.unwrap();
        assert_eq!(index.stats().await.unwrap().payloads, distinct);
        let hash = ContentHash::new(0);
        assert_eq!(index.insert(hash, b"payload 0").await.unwrap(), Outcome::Duplicate(()));
        index.shutdown().await.unwrap();

        let index = Index::open(&config(temp_dir.path(), Mode::Normal)).await.unwrap();
        assert_eq!(index.stats().await.unwrap().payloads, distinct);
        assert_eq!(payloads(&index, hash).await, vec![b"payload 0".to_vec()]);
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_everything() {
        let temp_dir = tempfile::tempdir().unwrap();
        let records = 200u64;
        let index = Index::open(&config(temp_dir.path(), Mode::Normal)).await.unwrap();
        for n in 0..records {
            let hash = ContentHash::new(n << 30);
            index.insert(hash, &n.to_le_bytes()).await.unwrap();
            index.insert_slot(hash, SlotFields { aux: n as u32, ..PRIMARY }).await.unwrap();
        }
        assert!(index.stats().await.unwrap().unsaved > 0);
        index.shutdown().await.unwrap();

        let err = index.insert(ContentHash::new(1), b"late").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Closed));
        assert!(matches!(&*index.lookup_slots(ContentHash::new(1), None).await.unwrap_err(), ErrorKind::Closed));
        assert!(matches!(&*index.save_all().await.unwrap_err(), ErrorKind::Closed));
        index.shutdown().await.unwrap();

        let index = Index::open(&config(temp_dir.path(), Mode::Normal)).await.unwrap();
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.payloads, records);
        assert_eq!(stats.slots, records as usize);
        assert_eq!(stats.next_seq, records + 1);
        for n in 0..records {
            let hash = ContentHash::new(n << 30);
            assert_eq!(payloads(&index, hash).await, vec![n.to_le_bytes().to_vec()]);
            assert_eq!(index.lookup_slots(hash, None).await.unwrap().len(), 1);
        }
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_requires_indexing_mode() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::init(temp_dir.path(), Mode::Normal).await.unwrap();
        let err = index.finish().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::WrongMode(Mode::Normal)));
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_all_clears_unsaved_work() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::init(temp_dir.path(), Mode::Normal).await.unwrap();
        index.insert(ContentHash::new(5), b"five").await.unwrap();
        index.insert_slot(ContentHash::new(5), PRIMARY).await.unwrap();
        // Uncommitted payloads are not visible to readers yet.
        assert!(payloads(&index, ContentHash::new(5)).await.is_empty());

        let report = index.save_all().await.unwrap();
        assert_eq!(report.shards_saved, 1);
        assert!(report.rows_committed >= 1);
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.unsaved, 0);
        assert_eq!(stats.dirty_rows, 0);
        assert!(stats.pending.iter().all(|(_, pending)| *pending == 0));
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bulk_insert_can_be_retried_after_a_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::open(&impatient(temp_dir.path())).await.unwrap();
        index.save_all().await.unwrap();
        let (left, right) = (ContentHash::new(42), ContentHash::new(43));

        let mut writer = intruder(temp_dir.path(), "payloads.sqlite").await;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut writer).await.unwrap();
        let err = index.insert(left, b"record").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Store));
        sqlx::query("ROLLBACK").execute(&mut writer).await.unwrap();
        assert_eq!(index.insert(left, b"record").await.unwrap(), Outcome::Inserted(()));
        assert_eq!(index.insert(left, b"record").await.unwrap(), Outcome::Duplicate(()));

        let mut writer = intruder(temp_dir.path(), "assoc-cites.sqlite").await;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut writer).await.unwrap();
        let err = index.insert_association("cites", left, right).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Store));
        sqlx::query("ROLLBACK").execute(&mut writer).await.unwrap();
        assert_eq!(index.insert_association("cites", left, right).await.unwrap(), Outcome::Inserted(()));

        index.finish().await.unwrap();
        assert_eq!(index.stats().await.unwrap().payloads, 1);
        assert_eq!(payloads(&index, left).await, vec![b"record".to_vec()]);
        assert_eq!(index.lookup_association("cites", left).await.unwrap(), vec![right]);
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_filters_are_rebuilt_after_a_rollback() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::open(&config(temp_dir.path(), Mode::Indexing)).await.unwrap();
        let kept = ContentHash::new(1 << 40);
        let lost = ContentHash::new(2 << 40);
        index.insert(kept, b"kept").await.unwrap();
        index.save_all().await.unwrap();
        {
            // A key whose row a failed commit threw away, and a store that
            // has rolled back since the filters were built.
            let mut state = index.state_mut().await.unwrap();
            let filters = state.filters.as_mut().unwrap();
            assert_eq!(filters.payloads.check_and_insert(lost, dedup_hash(b"lost")), Verdict::Inserted);
            filters.generation = u64::MAX;
        }
        assert_eq!(index.insert(lost, b"lost").await.unwrap(), Outcome::Inserted(()));
        assert_eq!(index.insert(kept, b"kept").await.unwrap(), Outcome::Duplicate(()));
        {
            let state = index.state().await.unwrap();
            assert_eq!(state.filters.as_ref().unwrap().generation, state.store.rollbacks());
        }
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_save_is_retried_in_full() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::open(&impatient(temp_dir.path())).await.unwrap();
        index.save_all().await.unwrap();
        let mut reader = intruder(temp_dir.path(), "payloads.sqlite").await;
        let hash = ContentHash::new(0x0123_4567_89ab_cdef);
        index.insert(hash, b"retry").await.unwrap();
        index.insert_slot(hash, PRIMARY).await.unwrap();
        let due = SaverConfig { idle_ms: 0, ..SaverConfig::default() };

        // An open read transaction keeps the commit from taking its lock.
        sqlx::raw_sql("BEGIN; SELECT COUNT(*) FROM payloads;").execute(&mut reader).await.unwrap();
        assert!(index.save_if_due(&due).await.is_err());
        assert_eq!(index.activity.unsaved(), 2);
        assert_eq!(index.state().await.unwrap().hashes.dirty_rows(), 1);
        sqlx::query("ROLLBACK").execute(&mut reader).await.unwrap();

        let report = index.save_if_due(&due).await.unwrap().unwrap();
        assert_eq!(report.shards_saved, 1);
        assert!(report.rows_committed >= 1);
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.unsaved, 0);
        assert_eq!(stats.dirty_rows, 0);
        assert_eq!(stats.payloads, 1);
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_final_flush_still_closes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Index::open(&impatient(temp_dir.path())).await.unwrap();
        index.save_all().await.unwrap();
        let mut reader = intruder(temp_dir.path(), "payloads.sqlite").await;
        index.insert(ContentHash::new(9), b"nine").await.unwrap();

        sqlx::raw_sql("BEGIN; SELECT COUNT(*) FROM payloads;").execute(&mut reader).await.unwrap();
        let err = index.shutdown().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Store));
        let err = index.insert(ContentHash::new(10), b"ten").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Closed));
        index.shutdown().await.unwrap();
        sqlx::query("ROLLBACK").execute(&mut reader).await.unwrap();
    }

    fn checksum(residual: u64, tag: u8) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&residual.to_le_bytes()[..5]);
        hasher.update(&[tag]);
        hasher.finalize()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_see_consistent_slots() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Arc::new(Index::init(temp_dir.path(), Mode::Normal).await.unwrap());
        let shards = 4u32;
        let per_writer = 300u64;

        let mut writers = Vec::new();
        for writer in 0..4u64 {
            let index = Arc::clone(&index);
            writers.push(tokio::spawn(async move {
                for n in 0..per_writer {
                    let residual = writer * per_writer + n;
                    let hash = ContentHash::from_parts((residual % u64::from(shards)) as u32, residual);
                    let tag = (n % 3) as u8;
                    let fields = SlotFields { section: Section::Derived, tag, aux: checksum(residual, tag) };
                    assert!(index.insert_slot(hash, fields).await.unwrap().is_inserted());
                }
            }));
        }
        let mut readers = Vec::new();
        for reader in 0..4u64 {
            let index = Arc::clone(&index);
            readers.push(tokio::spawn(async move {
                let mut seen = 0;
                for n in 0..(4 * per_writer) {
                    let residual = (n * 7 + reader) % (4 * per_writer);
                    let hash = ContentHash::from_parts((residual % u64::from(shards)) as u32, residual);
                    for found in index.lookup_slots(hash, None).await.unwrap() {
                        assert_eq!(found.slot.residual, residual);
                        assert_eq!(found.slot.aux, checksum(found.slot.residual, found.slot.tag));
                        seen += 1;
                    }
                }
                seen
            }));
        }
        let saver = {
            let index = Arc::clone(&index);
            tokio::spawn(async move {
                for _ in 0..5 {
                    index.save_all().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        for reader in readers {
            assert!(reader.await.unwrap() <= 4 * per_writer);
        }
        saver.await.unwrap();

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.slots, (4 * per_writer) as usize);
        assert_eq!(stats.populated_shards, shards as usize);
        assert_eq!(stats.next_seq, 4 * per_writer + 1);
        index.shutdown().await.unwrap();
    }
}
