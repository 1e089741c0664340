//! The full set of relations backing one index directory.

use crate::error::{ErrorKind, Result};
use crate::{AssociationTable, Mode, Options, PayloadTable, ShardTable};
use exn::ResultExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::instrument;

const SHARDS_FILE: &str = "shards.sqlite";
const PAYLOADS_FILE: &str = "payloads.sqlite";

/// Every relation of an index directory, opened in one [`Mode`].
pub struct Store {
    directory: PathBuf,
    mode: Mode,
    shards: ShardTable,
    payloads: PayloadTable,
    associations: BTreeMap<String, AssociationTable>,
}

impl Store {
    /// Open (creating if necessary) the index directory and every relation
    /// in it: shards, payloads and one file per named association.
    #[instrument(skip(directory, options, associations), fields(directory = %directory.as_ref().display()))]
    pub async fn open(
        directory: impl AsRef<Path>,
        mode: Mode,
        options: &Options,
        associations: &[String],
    ) -> Result<Self> {
        let directory = directory.as_ref();
        std::fs::create_dir_all(directory).or_raise(|| ErrorKind::Configuration(directory.to_path_buf()))?;

        let shards = ShardTable::open(directory.join(SHARDS_FILE), mode, options).await?;
        let payloads = match PayloadTable::open(directory.join(PAYLOADS_FILE), mode, options).await {
            Ok(payloads) => payloads,
            Err(err) => {
                if let Err(close_err) = shards.close().await {
                    tracing::warn!(error = ?close_err, "Failed to close shards after a failed open");
                }
                return Err(err);
            },
        };
        let mut store =
            Self { directory: directory.to_path_buf(), mode, shards, payloads, associations: BTreeMap::new() };
        for relation in associations {
            let path = directory.join(format!("assoc-{relation}.sqlite"));
            match AssociationTable::open(relation, path, mode, options).await {
                Ok(table) => {
                    store.associations.insert(relation.clone(), table);
                },
                Err(err) => {
                    if let Err(close_err) = store.close().await {
                        tracing::warn!(error = ?close_err, "Failed to close store after a failed open");
                    }
                    return Err(err);
                },
            }
        }
        tracing::info!(associations = store.associations.len(), "Store opened");
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn shards(&self) -> &ShardTable {
        &self.shards
    }

    pub fn payloads(&self) -> &PayloadTable {
        &self.payloads
    }

    /// The named association relation, if it was configured.
    pub fn association(&self, relation: &str) -> Option<&AssociationTable> {
        self.associations.get(relation)
    }

    pub fn associations(&self) -> impl Iterator<Item = &AssociationTable> {
        self.associations.values()
    }

    /// Uncommitted row counts per relation, keyed by table name.
    pub fn pending(&self) -> Vec<(String, u64)> {
        let mut pending = vec![
            (self.shards.name().to_string(), self.shards.pending()),
            (self.payloads.name().to_string(), self.payloads.pending()),
        ];
        pending.extend(self.associations.values().map(|table| (table.name().to_string(), table.pending())));
        pending
    }

    /// The largest uncommitted row count of any single relation.
    pub fn max_pending(&self) -> u64 {
        self.associations
            .values()
            .map(AssociationTable::pending)
            .chain([self.shards.pending(), self.payloads.pending()])
            .max()
            .unwrap_or(0)
    }

    /// Transactions discarded by failed commits, summed over every relation.
    ///
    /// Anything mirroring uncommitted rows in memory is stale once this
    /// changes.
    pub fn rollbacks(&self) -> u64 {
        self.associations
            .values()
            .map(AssociationTable::rollbacks)
            .chain([self.shards.rollbacks(), self.payloads.rollbacks()])
            .sum()
    }

    /// Commit every relation.
    ///
    /// Every relation is attempted even if an earlier one fails; the first
    /// failure is returned. Returns the number of rows made durable.
    #[instrument(skip(self))]
    pub async fn commit_all(&self) -> Result<u64> {
        let mut committed = 0;
        let mut first_error = None;
        let results = [
            (self.payloads.name(), self.payloads.commit().await),
            (self.shards.name(), self.shards.commit().await),
        ];
        for (name, result) in results {
            Self::tally(name, result, &mut committed, &mut first_error);
        }
        for table in self.associations.values() {
            let result = table.commit().await;
            Self::tally(table.name(), result, &mut committed, &mut first_error);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(committed),
        }
    }

    fn tally(name: &str, result: Result<u64>, committed: &mut u64, first_error: &mut Option<crate::error::Error>) {
        match result {
            Ok(rows) => *committed += rows,
            Err(err) => {
                tracing::error!(table = name, error = ?err, "Commit failed");
                if first_error.is_none() {
                    *first_error = Some(err);
                }
            },
        }
    }

    /// End a bulk load: commit everything, collapse duplicate keys and build
    /// the unique indexes. Afterwards the directory can be opened in
    /// [`Mode::Normal`] without any repair work.
    #[instrument(skip(self))]
    pub async fn finish(&self) -> Result<()> {
        self.shards.commit().await?;
        self.payloads.finish().await?;
        for table in self.associations.values() {
            table.finish().await?;
        }
        tracing::info!("Bulk load finished");
        Ok(())
    }

    /// Commit and close every relation. Every relation is closed even if an
    /// earlier one fails; the first failure is returned.
    #[instrument(skip(self))]
    pub async fn close(self) -> Result<()> {
        let mut results = vec![self.payloads.close().await, self.shards.close().await];
        for (_, table) in self.associations {
            results.push(table.close().await);
        }
        results.into_iter().collect::<Result<Vec<()>>>()?;
        tracing::info!("Store closed");
        Ok(())
    }
}
