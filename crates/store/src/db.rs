//! Connection channels for a single relation.

use crate::error::{ErrorKind, Result};
use crate::{Mode, Options};
use exn::ResultExt;
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection, Sqlite, SqliteConnection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

/// The write channel: one connection, one long-lived transaction.
struct Writer {
    conn: SqliteConnection,
    in_transaction: bool,
}

impl Writer {
    async fn begin(&mut self) -> Result<&mut SqliteConnection> {
        if !self.in_transaction {
            sqlx::query("BEGIN").execute(&mut self.conn).await.or_raise(|| ErrorKind::Database)?;
            self.in_transaction = true;
        }
        Ok(&mut self.conn)
    }
}

/// SQLITE_BUSY and SQLITE_LOCKED leave the transaction open, so the commit
/// can simply be attempted again later. Anything else may have rolled it back.
fn is_busy(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

/// A relation's database file, with its write and read channels.
pub(crate) struct Table {
    name: String,
    path: PathBuf,
    mode: Mode,
    writer: Mutex<Writer>,
    reader: SqlitePool,
    /// Rows written since the last successful commit.
    pending: AtomicU64,
    /// Transactions lost to a failed commit.
    rollbacks: AtomicU64,
}

impl Table {
    /// Open (creating if missing) the database file at `path`, bring its
    /// schema up to date and start the write transaction.
    #[instrument(skip(path, options, migrator), fields(path = %path.as_ref().display()))]
    pub(crate) async fn open(
        name: String,
        path: impl AsRef<Path>,
        mode: Mode,
        options: &Options,
        migrator: &'static Migrator,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut conn = Self::base_options(path, mode, options)
            .create_if_missing(true)
            // Only takes effect on a brand new file, but explicit is better.
            .auto_vacuum(SqliteAutoVacuum::None)
            .connect()
            .await
            .or_raise(|| ErrorKind::Configuration(path.to_path_buf()))?;
        Self::apply_pragmas(&mut conn, mode).await.or_raise(|| ErrorKind::Database)?;
        migrator.run(&mut conn).await.or_raise(|| ErrorKind::Schema)?;

        let reader = SqlitePoolOptions::new()
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_read_pragmas(conn, meta).await }))
            .max_connections(options.read_connections)
            .connect_with(Self::base_options(path, mode, options).read_only(true))
            .await
            .or_raise(|| ErrorKind::Configuration(path.to_path_buf()))?;

        let mut writer = Writer { conn, in_transaction: false };
        writer.begin().await?;
        Ok(Self {
            name,
            path: path.to_path_buf(),
            mode,
            writer: Mutex::new(writer),
            reader,
            pending: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        })
    }

    /// Connection options shared between the write and read channels.
    fn base_options(path: &Path, mode: Mode, options: &Options) -> SqliteConnectOptions {
        let base = SqliteConnectOptions::new()
            .filename(path)
            .foreign_keys(false)
            .busy_timeout(Duration::from_millis(options.busy_timeout_ms));
        match mode {
            // Readers keep reading while the writer holds its transaction open.
            Mode::Normal => base.journal_mode(SqliteJournalMode::Wal).synchronous(SqliteSynchronous::Full),
            // A crash during a bulk load means rerunning the load, so there is
            // nothing worth syncing to disk until the final commit.
            Mode::Indexing => base.journal_mode(SqliteJournalMode::Memory).synchronous(SqliteSynchronous::Off),
        }
    }

    /// Apply PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, mode: Mode) -> sqlx::Result<()> {
        let pragmas = match mode {
            Mode::Normal => {
                r#"
                    PRAGMA locking_mode = NORMAL;
                    PRAGMA wal_autocheckpoint = 800;
                    PRAGMA cache_size = -8192;
                    PRAGMA temp_store = MEMORY;
                "#
            },
            // Keep the whole bulk transaction in the page cache instead of
            // spilling half-written pages into the database file.
            Mode::Indexing => {
                r#"
                    PRAGMA locking_mode = NORMAL;
                    PRAGMA cache_size = -262144;
                    PRAGMA temp_store = MEMORY;
                "#
            },
        };
        sqlx::raw_sql(pragmas).execute(conn).await?;
        Ok(())
    }

    async fn apply_read_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA cache_size = -8192;
                PRAGMA mmap_size = 33554432;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    /// Rows written since the last successful commit.
    pub(crate) fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// How many times a failed commit has discarded the open transaction.
    pub(crate) fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Acquire)
    }

    /// Run one statement on the write channel, inside the open transaction.
    ///
    /// Returns the number of rows affected.
    pub(crate) async fn execute<'q>(&self, query: Query<'q, Sqlite, SqliteArguments<'q>>) -> Result<u64> {
        let mut writer = self.writer.lock().await;
        let conn = writer.begin().await?;
        let affected = query.execute(conn).await.or_raise(|| ErrorKind::Database)?.rows_affected();
        self.pending.fetch_add(affected, Ordering::AcqRel);
        Ok(affected)
    }

    /// Run a multi-statement script (DDL) on the write channel.
    pub(crate) async fn execute_script(&self, script: &'static str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let conn = writer.begin().await?;
        sqlx::raw_sql(script).execute(conn).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Whether an index exists, as seen from inside the write transaction.
    pub(crate) async fn index_exists(&self, index: &str) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        let conn = writer.begin().await?;
        let found: i64 = sqlx::query_scalar(include_str!("../queries/index_exists.sql"))
            .bind(index)
            .fetch_one(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(found > 0)
    }

    /// Make sure a unique key index exists, collapsing any duplicate rows
    /// left behind by an unfinished bulk load before building it.
    ///
    /// Returns `true` if the index had to be built.
    pub(crate) async fn ensure_unique_key(&self, index: &str, build: &'static str) -> Result<bool> {
        if self.index_exists(index).await? {
            return Ok(false);
        }
        tracing::info!(table = %self.name, index, "Building unique key");
        self.execute_script(build).await?;
        self.commit().await?;
        Ok(true)
    }

    /// Count rows through the read channel (committed rows only).
    pub(crate) async fn count(&self, query: &'static str) -> Result<u64> {
        let rows: i64 = sqlx::query_scalar(query).fetch_one(&self.reader).await.or_raise(|| ErrorKind::Database)?;
        u64::try_from(rows).or_raise(|| ErrorKind::InvalidData("row count"))
    }

    /// End the long transaction and immediately start the next one.
    ///
    /// Returns the number of rows that became durable.
    #[instrument(skip(self), fields(table = %self.name))]
    pub(crate) async fn commit(&self) -> Result<u64> {
        let mut writer = self.writer.lock().await;
        let committed = self.end_transaction(&mut writer).await?;
        writer.begin().await?;
        tracing::trace!(rows = committed, "Transaction committed");
        Ok(committed)
    }

    async fn end_transaction(&self, writer: &mut Writer) -> Result<u64> {
        if !writer.in_transaction {
            return Ok(0);
        }
        if let Err(err) = sqlx::query("COMMIT").execute(&mut writer.conn).await {
            if !is_busy(&err) {
                // Put the connection back into a known state; whatever was
                // pending is gone either way.
                _ = sqlx::query("ROLLBACK").execute(&mut writer.conn).await;
                writer.in_transaction = false;
                let lost = self.pending.swap(0, Ordering::AcqRel);
                self.rollbacks.fetch_add(1, Ordering::AcqRel);
                tracing::error!(table = %self.name, rows = lost, "Commit failed; transaction rolled back");
            }
            return Err(err).or_raise(|| ErrorKind::Database);
        }
        writer.in_transaction = false;
        Ok(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Commit whatever is outstanding and close both channels.
    ///
    /// The connections are closed even if the final commit fails.
    #[instrument(skip(self), fields(table = %self.name))]
    pub(crate) async fn close(self) -> Result<()> {
        // Readers go first so the writer is the last connection and can
        // checkpoint the WAL away.
        self.reader.close().await;
        let mut writer = self.writer.into_inner();
        let committed = Self::finalize(&self.name, &self.pending, &mut writer).await;
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&mut writer.conn).await;
        let closed = writer.conn.close().await.or_raise(|| ErrorKind::Database);
        tracing::debug!(path = %self.path.display(), "Table closed");
        committed.and(closed)
    }

    async fn finalize(name: &str, pending: &AtomicU64, writer: &mut Writer) -> Result<()> {
        if !writer.in_transaction {
            return Ok(());
        }
        sqlx::query("COMMIT").execute(&mut writer.conn).await.or_raise(|| ErrorKind::Database)?;
        writer.in_transaction = false;
        let rows = pending.swap(0, Ordering::AcqRel);
        tracing::trace!(table = name, rows, "Final transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static MIGRATOR: Migrator = sqlx::migrate!("./migrations/payloads");

    async fn open(dir: &Path, mode: Mode) -> Table {
        Table::open("test".to_string(), dir.join("test.sqlite"), mode, &Options::default(), &MIGRATOR)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let table = open(temp_dir.path(), Mode::Normal).await;
        assert!(temp_dir.path().join("test.sqlite").exists());
        assert_eq!(table.name(), "test");
        table.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_inside_a_file_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("plain");
        std::fs::write(&file, b"not a directory").unwrap();
        let result =
            Table::open("test".to_string(), file.join("test.sqlite"), Mode::Normal, &Options::default(), &MIGRATOR)
                .await;
        let err = result.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Configuration(_)));
    }

    #[tokio::test]
    async fn test_journal_mode_follows_mode() {
        let temp_dir = tempfile::tempdir().unwrap();
        let table = open(temp_dir.path(), Mode::Normal).await;
        let journal: String = sqlx::query_scalar("PRAGMA journal_mode").fetch_one(table.reader()).await.unwrap();
        assert_eq!(journal, "wal");
        table.close().await.unwrap();

        let table = open(temp_dir.path(), Mode::Indexing).await;
        let journal: String = sqlx::query_scalar("PRAGMA journal_mode").fetch_one(table.reader()).await.unwrap();
        assert_eq!(journal, "memory");
        table.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_channel_applies_pragmas() {
        let temp_dir = tempfile::tempdir().unwrap();
        let table = open(temp_dir.path(), Mode::Indexing).await;
        let cache: i64 = sqlx::query_scalar("PRAGMA cache_size").fetch_one(table.reader()).await.unwrap();
        assert_eq!(cache, -8192);
        table.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        open(temp_dir.path(), Mode::Normal).await.close().await.unwrap();
        // Reopening runs the (already applied) migrations again.
        open(temp_dir.path(), Mode::Normal).await.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reads_see_committed_rows_only() {
        let temp_dir = tempfile::tempdir().unwrap();
        let table = open(temp_dir.path(), Mode::Normal).await;
        let affected = table
            .execute(sqlx::query("INSERT INTO payloads (primary_hash, dedup_hash, payload) VALUES (1, 2, x'00')"))
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(table.pending(), 1);
        // The read channel works while the write transaction is open...
        assert_eq!(table.count("SELECT COUNT(*) FROM payloads").await.unwrap(), 0);
        // ... and sees the row once it is committed.
        assert_eq!(table.commit().await.unwrap(), 1);
        assert_eq!(table.pending(), 0);
        assert_eq!(table.count("SELECT COUNT(*) FROM payloads").await.unwrap(), 1);
        table.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_commits_outstanding_rows() {
        let temp_dir = tempfile::tempdir().unwrap();
        let table = open(temp_dir.path(), Mode::Normal).await;
        table
            .execute(sqlx::query("INSERT INTO payloads (primary_hash, dedup_hash, payload) VALUES (1, 2, x'00')"))
            .await
            .unwrap();
        table.close().await.unwrap();
        let table = open(temp_dir.path(), Mode::Normal).await;
        assert_eq!(table.count("SELECT COUNT(*) FROM payloads").await.unwrap(), 1);
        table.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_index_exists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let table = open(temp_dir.path(), Mode::Normal).await;
        assert!(!table.index_exists("payloads_key").await.unwrap());
        table.execute_script("CREATE UNIQUE INDEX payloads_key ON payloads (primary_hash, dedup_hash);").await.unwrap();
        assert!(table.index_exists("payloads_key").await.unwrap());
        table.close().await.unwrap();
    }
}
