//! The `payloads` relation: variable-length records keyed by content hash.

use crate::Cursor;
use crate::db::Table;
use crate::error::{ErrorKind, Result};
use crate::{Mode, Options, from_sql, to_sql};
use async_stream::stream;
use exn::ResultExt;
use futures::StreamExt;
use sqlx::migrate::Migrator;
use std::path::Path;
use tracing::instrument;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/payloads");

const KEY_INDEX: &str = "payloads_key";

/// Payload bytes keyed by `(primary_hash, dedup_hash)`.
///
/// In [`Mode::Normal`] the unique key makes inserts idempotent. In
/// [`Mode::Indexing`] the key is absent until [`PayloadTable::finish`], and
/// the caller is responsible for not inserting the same key twice.
pub struct PayloadTable {
    table: Table,
}

impl PayloadTable {
    pub(crate) async fn open(path: impl AsRef<Path>, mode: Mode, options: &Options) -> Result<Self> {
        let table = Table::open("payloads".to_string(), path, mode, options, &MIGRATOR).await?;
        match mode {
            Mode::Normal => {
                table.ensure_unique_key(KEY_INDEX, include_str!("../queries/build_payloads_key.sql")).await?;
            },
            Mode::Indexing => table.execute_script(include_str!("../queries/drop_payloads_key.sql")).await?,
        }
        Ok(Self { table })
    }

    /// Insert a payload. Returns `false` if the key was already present
    /// (normal mode only; bulk inserts always report `true`).
    pub async fn insert(&self, primary: u64, dedup: u64, payload: &[u8]) -> Result<bool> {
        let sql = match self.table.mode() {
            Mode::Normal => include_str!("../queries/insert_payload_or_ignore.sql"),
            Mode::Indexing => include_str!("../queries/insert_payload.sql"),
        };
        let query = sqlx::query(sql).bind(to_sql(primary)).bind(to_sql(dedup)).bind(payload);
        Ok(self.table.execute(query).await? > 0)
    }

    /// Committed payloads stored under `primary`, in insertion order.
    pub fn open_cursor(&self, primary: u64) -> Cursor<Vec<u8>> {
        let pool = self.table.reader().clone();
        let primary = to_sql(primary);
        Cursor::new(stream! {
            let mut rows = sqlx::query_scalar::<_, Vec<u8>>(include_str!("../queries/select_payloads.sql"))
                .bind(primary)
                .fetch(&pool);
            while let Some(row) = rows.next().await {
                yield row.or_raise(|| ErrorKind::Database);
            }
        })
    }

    /// Every committed `(primary_hash, dedup_hash)` key.
    pub fn keys(&self) -> Cursor<(u64, u64)> {
        let pool = self.table.reader().clone();
        Cursor::new(stream! {
            let mut rows = sqlx::query_as::<_, (i64, i64)>(include_str!("../queries/select_payload_keys.sql"))
                .fetch(&pool);
            while let Some(row) = rows.next().await {
                yield row.map(|(primary, dedup)| (from_sql(primary), from_sql(dedup))).or_raise(|| ErrorKind::Database);
            }
        })
    }

    /// Number of committed payload rows.
    pub async fn count(&self) -> Result<u64> {
        self.table.count(include_str!("../queries/count_payloads.sql")).await
    }

    pub fn pending(&self) -> u64 {
        self.table.pending()
    }

    /// Number of transactions discarded by a failed commit.
    pub fn rollbacks(&self) -> u64 {
        self.table.rollbacks()
    }

    pub async fn commit(&self) -> Result<u64> {
        self.table.commit().await
    }

    /// Commit, collapse any duplicate keys and build the unique key.
    #[instrument(skip(self))]
    pub(crate) async fn finish(&self) -> Result<()> {
        self.table.commit().await?;
        self.table.ensure_unique_key(KEY_INDEX, include_str!("../queries/build_payloads_key.sql")).await?;
        Ok(())
    }

    pub(crate) fn name(&self) -> &str {
        self.table.name()
    }

    pub(crate) async fn close(self) -> Result<()> {
        self.table.close().await
    }
}
