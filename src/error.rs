//! CLI Error Types

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("index operation failed")]
    Index,
    /// A line of ingest input could not be parsed.
    #[display("line {_0}: malformed record")]
    Record(#[error(not(source))] usize),
    #[display("invalid record: {_0}")]
    Parse(#[error(not(source))] String),
    #[display("I/O error")]
    Io,
}
