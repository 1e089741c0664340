//! Named association relations: `(left_hash, right_hash)` edges.

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

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/associations");

const KEY_INDEX: &str = "associations_key";

/// One association relation, looked up by its left hash.
pub struct AssociationTable {
    relation: String,
    table: Table,
}

impl AssociationTable {
    pub(crate) async fn open(
        relation: &str,
        path: impl AsRef<Path>,
        mode: Mode,
        options: &Options,
    ) -> Result<Self> {
        let table = Table::open(format!("assoc-{relation}"), path, mode, options, &MIGRATOR).await?;
        match mode {
            Mode::Normal => {
                table.ensure_unique_key(KEY_INDEX, include_str!("../queries/build_associations_key.sql")).await?;
            },
            Mode::Indexing => table.execute_script(include_str!("../queries/drop_associations_key.sql")).await?,
        }
        Ok(Self { relation: relation.to_string(), table })
    }

    /// The relation's name, as configured.
    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Insert an edge. Returns `false` if it was already present (normal
    /// mode only).
    pub async fn insert(&self, left: u64, right: u64) -> Result<bool> {
        let sql = match self.table.mode() {
            Mode::Normal => include_str!("../queries/insert_association_or_ignore.sql"),
            Mode::Indexing => include_str!("../queries/insert_association.sql"),
        };
        Ok(self.table.execute(sqlx::query(sql).bind(to_sql(left)).bind(to_sql(right))).await? > 0)
    }

    /// Committed right hashes associated with `left`, in insertion order.
    pub async fn lookup(&self, left: u64) -> Result<Vec<u64>> {
        let rows: Vec<i64> = sqlx::query_scalar(include_str!("../queries/select_associations.sql"))
            .bind(to_sql(left))
            .fetch_all(self.table.reader())
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(from_sql).collect())
    }

    /// Every committed `(left_hash, right_hash)` edge.
    pub fn keys(&self) -> Cursor<(u64, u64)> {
        let pool = self.table.reader().clone();
        Cursor::new(stream! {
            let mut rows = sqlx::query_as::<_, (i64, i64)>(include_str!("../queries/select_association_keys.sql"))
                .fetch(&pool);
            while let Some(row) = rows.next().await {
                yield row.map(|(left, right)| (from_sql(left), from_sql(right))).or_raise(|| ErrorKind::Database);
            }
        })
    }

    pub async fn count(&self) -> Result<u64> {
        self.table.count(include_str!("../queries/count_associations.sql")).await
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

    #[instrument(skip(self), fields(relation = %self.relation))]
    pub(crate) async fn finish(&self) -> Result<()> {
        self.table.commit().await?;
        self.table.ensure_unique_key(KEY_INDEX, include_str!("../queries/build_associations_key.sql")).await?;
        Ok(())
    }

    pub(crate) fn name(&self) -> &str {
        self.table.name()
    }

    pub(crate) async fn close(self) -> Result<()> {
        self.table.close().await
    }
}
