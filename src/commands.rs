//! Subcommand implementations.

use crate::error::{ErrorKind, Result};
use crate::record::Record;
use exn::ResultExt;
use refindex_index::{Config, ContentHash, Index, Mode, Outcome, Saver};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Tally {
    pub(crate) inserted: u64,
    pub(crate) duplicate: u64,
    pub(crate) full: u64,
}

impl Tally {
    fn add<T>(&mut self, outcome: Outcome<T>) {
        match outcome {
            Outcome::Inserted(_) => self.inserted += 1,
            Outcome::Duplicate(_) => self.duplicate += 1,
            Outcome::Full => self.full += 1,
        }
    }
}

/// Resolves once the process is asked to stop.
async fn terminated() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
                return;
            },
            Err(err) => tracing::warn!(error = %err, "Cannot listen for SIGTERM"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn apply(index: &Index, record: Record) -> Result<Outcome<()>> {
    let outcome = match record {
        Record::Payload { hash, payload } => index.insert(hash, payload.as_bytes()).await,
        Record::Link { relation, left, right } => index.insert_association(&relation, left, right).await,
        Record::Slot { hash, fields } => index.insert_slot(hash, fields).await.map(|outcome| match outcome {
            Outcome::Inserted(_) => Outcome::Inserted(()),
            Outcome::Duplicate(_) => Outcome::Duplicate(()),
            Outcome::Full => Outcome::Full,
        }),
    };
    outcome.or_raise(|| ErrorKind::Index)
}

/// Feed every record of `input` into the index, stopping early if
/// `stop` resolves first. Returns `true` if the input was read to the end.
pub(crate) async fn feed(
    index: &Index,
    input: impl AsyncBufRead + Unpin,
    stop: impl Future<Output = ()>,
    tally: &mut Tally,
) -> Result<bool> {
    let mut lines = input.lines();
    let mut number = 0;
    tokio::pin!(stop);
    loop {
        let line = tokio::select! {
            biased;
            () = &mut stop => {
                tracing::info!(line = number, "Interrupted; stopping ingest");
                return Ok(false);
            },
            line = lines.next_line() => line.or_raise(|| ErrorKind::Io)?,
        };
        let Some(line) = line else {
            return Ok(true);
        };
        number += 1;
        let Some(record) = Record::parse_line(&line).or_raise(|| ErrorKind::Record(number))? else {
            continue;
        };
        tally.add(apply(index, record).await?);
    }
}

pub(crate) async fn ingest(config: &Config, input: Option<&Path>) -> Result<()> {
    let index = Arc::new(Index::open(config).await.or_raise(|| ErrorKind::Index)?);
    let saver = match config.mode {
        Mode::Normal => Some(Saver::spawn(Arc::clone(&index), config.saver.clone())),
        Mode::Indexing => None,
    };

    let mut tally = Tally::default();
    let fed = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await.or_raise(|| ErrorKind::Io)?;
            feed(&index, BufReader::new(file), terminated(), &mut tally).await
        },
        None => feed(&index, BufReader::new(tokio::io::stdin()), terminated(), &mut tally).await,
    };

    if let Some(saver) = saver {
        saver.stop().await;
    }
    let finished = match fed {
        Ok(true) if config.mode == Mode::Indexing => index.finish().await.map(|_| ()).or_raise(|| ErrorKind::Index),
        Ok(_) => Ok(()),
        Err(err) => Err(err),
    };
    let closed = index.shutdown().await.or_raise(|| ErrorKind::Index);
    tracing::info!(inserted = tally.inserted, duplicate = tally.duplicate, full = tally.full, "Ingest done");
    println!("inserted\t{}\nduplicate\t{}\nfull\t{}", tally.inserted, tally.duplicate, tally.full);
    finished.and(closed)
}

pub(crate) async fn lookup(config: &Config, hash: ContentHash, tag: Option<u8>, relation: Option<&str>) -> Result<()> {
    let index = Index::open(config).await.or_raise(|| ErrorKind::Index)?;
    let result = print_lookup(&index, hash, tag, relation).await;
    let closed = index.shutdown().await.or_raise(|| ErrorKind::Index);
    result.and(closed)
}

async fn print_lookup(index: &Index, hash: ContentHash, tag: Option<u8>, relation: Option<&str>) -> Result<()> {
    if let Some(relation) = relation {
        for right in index.lookup_association(relation, hash).await.or_raise(|| ErrorKind::Index)? {
            println!("{right}");
        }
        return Ok(());
    }
    for found in index.lookup_slots(hash, tag).await.or_raise(|| ErrorKind::Index)? {
        println!("slot\t{}\t{}\t{}\t{}", found.at.section, found.slot.tag, found.slot.aux, found.slot.seq);
    }
    let mut cursor = index.open_cursor(hash).await.or_raise(|| ErrorKind::Index)?;
    while let Some(payload) = cursor.next().await {
        let payload = payload.or_raise(|| ErrorKind::Index)?;
        println!("payload\t{}", String::from_utf8_lossy(&payload));
    }
    Ok(())
}

pub(crate) async fn stats(config: &Config) -> Result<()> {
    let index = Index::open(config).await.or_raise(|| ErrorKind::Index)?;
    let stats = index.stats().await.or_raise(|| ErrorKind::Index);
    let closed = index.shutdown().await.or_raise(|| ErrorKind::Index);
    let stats = stats?;
    println!("directory\t{}", index.directory().display());
    println!("shards\t{}", stats.populated_shards);
    println!("slots\t{}", stats.slots);
    println!("payloads\t{}", stats.payloads);
    println!("next_seq\t{}", stats.next_seq);
    closed
}
