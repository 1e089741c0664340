//! The `shards` relation: one row per populated hash-table shard.

use crate::Cursor;
use crate::db::Table;
use crate::error::{ErrorKind, Result};
use crate::{Mode, Options};
use async_stream::stream;
use exn::ResultExt;
use futures::StreamExt;
use sqlx::migrate::Migrator;
use std::path::Path;
use tracing::instrument;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/shards");

/// A persisted shard row, exactly as stored.
///
/// Values are kept in their column representation; range and length checks
/// belong to whoever decodes `slots`.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct ShardRecord {
    pub shard_id: i64,
    pub primary_count: i64,
    pub derived_count: i64,
    pub slots: Vec<u8>,
}

/// Persistence for the in-memory shard rows.
pub struct ShardTable {
    table: Table,
}

impl ShardTable {
    pub(crate) async fn open(path: impl AsRef<Path>, mode: Mode, options: &Options) -> Result<Self> {
        let table = Table::open("shards".to_string(), path, mode, options, &MIGRATOR).await?;
        Ok(Self { table })
    }

    /// Every non-empty shard row that has been committed, in shard order.
    pub fn scan(&self) -> Cursor<ShardRecord> {
        let pool = self.table.reader().clone();
        Cursor::new(stream! {
            let mut rows = sqlx::query_as::<_, ShardRecord>(include_str!("../queries/select_shards.sql")).fetch(&pool);
            while let Some(row) = rows.next().await {
                yield row.or_raise(|| ErrorKind::Database);
            }
        })
    }

    /// Upsert the given rows and commit them as one transaction.
    ///
    /// Returns the number of rows written. Nothing is durable (and the caller
    /// should consider nothing saved) unless this returns `Ok`.
    #[instrument(skip_all, fields(rows = records.len()))]
    pub async fn save(&self, records: &[ShardRecord]) -> Result<u64> {
        for record in records {
            self.table
                .execute(
                    sqlx::query(include_str!("../queries/upsert_shard.sql"))
                        .bind(record.shard_id)
                        .bind(record.primary_count)
                        .bind(record.derived_count)
                        .bind(record.slots.as_slice()),
                )
                .await?;
        }
        self.table.commit().await
    }

    /// Number of committed shard rows, including emptied ones.
    pub async fn count(&self) -> Result<u64> {
        self.table.count(include_str!("../queries/count_shards.sql")).await
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

    pub(crate) fn name(&self) -> &str {
        self.table.name()
    }

    pub(crate) async fn close(self) -> Result<()> {
        self.table.close().await
    }
}
