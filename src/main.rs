//! `refindex`: build and query a content-hash index from the command line.

mod commands;
mod error;
mod record;

use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand};
use exn::ResultExt;
use refindex_index::{Config, ContentHash, Mode};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

#[derive(Parser)]
#[command(name = "refindex", version, about = "Content-addressable hash index")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(long, global = true, env = "REFINDEX_CONFIG")]
    config: Option<PathBuf>,
    /// Index directory, overriding the configured one.
    #[arg(long, global = true)]
    directory: Option<PathBuf>,
    /// More output; repeat for more detail.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load tab-separated records from a file, or stdin.
    Ingest {
        /// Bulk (re)load: fast, not crash safe, deduplicated in memory.
        #[arg(long)]
        bulk: bool,
        input: Option<PathBuf>,
    },
    /// Show the slots and payloads stored under a hash.
    Lookup {
        /// Hexadecimal content hash.
        hash: String,
        /// Only slots with this tag.
        #[arg(long)]
        tag: Option<u8>,
        /// Show association targets from this relation instead.
        #[arg(long)]
        relation: Option<String>,
    },
    /// Print index statistics.
    Stats,
}

fn level(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn load_config(cli: &Cli, mode: Mode) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    if let Some(directory) = &cli.directory {
        config.directory = directory.clone();
    }
    config.mode = mode;
    config.validate().or_raise(|| ErrorKind::Config)?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Ingest { bulk, input } => {
            let mode = if *bulk { Mode::Indexing } else { Mode::Normal };
            let config = load_config(&cli, mode)?;
            commands::ingest(&config, input.as_deref()).await
        },
        Command::Lookup { hash, tag, relation } => {
            let hash = hash.parse::<ContentHash>().or_raise(|| ErrorKind::Parse(format!("bad hash {hash:?}")))?;
            let config = load_config(&cli, Mode::Normal)?;
            commands::lookup(&config, hash, *tag, relation.as_deref()).await
        },
        Command::Stats => commands::stats(&load_config(&cli, Mode::Normal)?).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(level(cli.verbose)).with_writer(std::io::stderr).init();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:?}");
            ExitCode::FAILURE
        },
    }
}
