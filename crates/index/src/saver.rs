//! Background saving.

use crate::Index;
use crate::error::ErrorKind;
use refindex_config::SaverConfig;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// A task that periodically commits and saves an [`Index`].
///
/// On every tick it saves if there is unsaved work and either nothing has
/// been written for `idle_ms`, or some table has `pending_threshold`
/// uncommitted rows. Failed saves are logged and retried on the next tick.
pub struct Saver {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Saver {
    pub fn spawn(index: Arc<Index>, config: SaverConfig) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut tick = interval(config.tick());
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {},
                    _ = stopped.changed() => break,
                }
                match index.save_if_due(&config).await {
                    Ok(Some(report)) => {
                        tracing::debug!(rows = report.rows_committed, shards = report.shards_saved, "Background save");
                    },
                    Ok(None) => {},
                    Err(err) if matches!(*err, ErrorKind::Closed) => break,
                    Err(err) => tracing::warn!(error = ?err, "Background save failed; retrying on next tick"),
                }
            }
            tracing::debug!("Saver stopped");
        });
        Self { stop, handle }
    }

    /// Stop the loop and wait for an in-flight save to complete.
    pub async fn stop(self) {
        _ = self.stop.send(true);
        if let Err(err) = self.handle.await {
            tracing::error!(error = %err, "Saver task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;
    use refindex_config::Config;
    use refindex_store::{Mode, Options};
    use sqlx::ConnectOptions;
    use sqlx::sqlite::SqliteConnectOptions;
    use std::time::Duration;

    fn config(idle_ms: u64, pending_threshold: u64) -> SaverConfig {
        SaverConfig { tick_ms: 10, idle_ms, pending_threshold }
    }

    async fn wait_for_save(index: &Index) -> bool {
        for _ in 0..500 {
            if index.stats().await.is_ok_and(|stats| stats.unsaved == 0) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_saves_once_idle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Arc::new(Index::init(temp_dir.path(), Mode::Normal).await.unwrap());
        let saver = Saver::spawn(Arc::clone(&index), config(50, u64::MAX));

        index.insert(ContentHash::new(1), b"one").await.unwrap();
        assert!(wait_for_save(&index).await);
        assert_eq!(index.stats().await.unwrap().payloads, 1);

        saver.stop().await;
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_saves_under_pressure_without_idling() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Arc::new(Index::init(temp_dir.path(), Mode::Normal).await.unwrap());
        // Never idle long enough; only the threshold can trigger a save.
        let saver = Saver::spawn(Arc::clone(&index), config(u64::MAX / 2, 3));

        for n in 0..3u64 {
            index.insert(ContentHash::new(n), &n.to_le_bytes()).await.unwrap();
        }
        assert!(wait_for_save(&index).await);
        assert_eq!(index.stats().await.unwrap().payloads, 3);

        saver.stop().await;
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_nothing_is_saved_below_thresholds() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Arc::new(Index::init(temp_dir.path(), Mode::Normal).await.unwrap());
        let saver = Saver::spawn(Arc::clone(&index), config(u64::MAX / 2, 1_000));

        index.insert(ContentHash::new(1), b"one").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(index.stats().await.unwrap().unsaved, 1);

        saver.stop().await;
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_keeps_running_after_failed_saves() {
        let temp_dir = tempfile::tempdir().unwrap();
        let settings = Config {
            directory: temp_dir.path().to_path_buf(),
            mode: Mode::Indexing,
            store: Options { busy_timeout_ms: 50, ..Options::default() },
            ..Config::default()
        };
        let index = Arc::new(Index::open(&settings).await.unwrap());
        index.save_all().await.unwrap();
        let mut reader =
            SqliteConnectOptions::new().filename(temp_dir.path().join("payloads.sqlite")).connect().await.unwrap();
        // Hold a read transaction so every commit of the payloads file fails.
        sqlx::raw_sql("BEGIN; SELECT COUNT(*) FROM payloads;").execute(&mut reader).await.unwrap();
        let saver = Saver::spawn(Arc::clone(&index), config(0, u64::MAX));

        index.insert(ContentHash::new(1), b"one").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!saver.is_finished());
        sqlx::query("ROLLBACK").execute(&mut reader).await.unwrap();

        assert!(wait_for_save(&index).await);
        assert_eq!(index.stats().await.unwrap().payloads, 1);
        saver.stop().await;
        index.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_by_itself_once_index_is_closed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = Arc::new(Index::init(temp_dir.path(), Mode::Normal).await.unwrap());
        let saver = Saver::spawn(Arc::clone(&index), config(10, 1));
        index.shutdown().await.unwrap();
        for _ in 0..100 {
            if saver.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saver.is_finished());
        saver.stop().await;
    }
}
