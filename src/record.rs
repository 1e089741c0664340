//! Tab-separated ingest records.
//!
//! ```text
//! payload <TAB> HASH <TAB> TEXT
//! link    <TAB> RELATION <TAB> LEFT <TAB> RIGHT
//! slot    <TAB> HASH <TAB> p|d <TAB> TAG <TAB> AUX
//! ```
//!
//! Hashes are hexadecimal. Blank lines and lines starting with `#` are
//! ignored.

use crate::error::{Error, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use refindex_index::{ContentHash, Section, SlotFields};
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Payload { hash: ContentHash, payload: String },
    Link { relation: String, left: ContentHash, right: ContentHash },
    Slot { hash: ContentHash, fields: SlotFields },
}

impl Record {
    /// Parse one input line; `None` for lines that carry no record.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        line.parse().map(Some)
    }
}

fn hash(field: &str) -> Result<ContentHash> {
    field.parse::<ContentHash>().or_raise(|| ErrorKind::Parse(format!("bad hash {field:?}")))
}

fn section(field: &str) -> Result<Section> {
    match field {
        "p" | "primary" => Ok(Section::Primary),
        "d" | "derived" => Ok(Section::Derived),
        other => exn::bail!(ErrorKind::Parse(format!("unknown section {other:?}"))),
    }
}

impl FromStr for Record {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        let kind = fields.next().unwrap_or_default();
        let mut next = |name: &str| fields.next().ok_or_raise(|| ErrorKind::Parse(format!("missing {name}")));
        let record = match kind {
            "payload" => Self::Payload { hash: hash(next("hash")?)?, payload: next("payload")?.to_string() },
            "link" => Self::Link {
                relation: next("relation")?.to_string(),
                left: hash(next("left hash")?)?,
                right: hash(next("right hash")?)?,
            },
            "slot" => {
                let hash = hash(next("hash")?)?;
                let section = section(next("section")?)?;
                let tag = next("tag")?;
                let tag = tag.parse::<u8>().or_raise(|| ErrorKind::Parse(format!("bad tag {tag:?}")))?;
                let aux = next("aux")?;
                let aux = aux.parse::<u32>().or_raise(|| ErrorKind::Parse(format!("bad aux {aux:?}")))?;
                Self::Slot { hash, fields: SlotFields { section, tag, aux } }
            },
            other => exn::bail!(ErrorKind::Parse(format!("unknown record type {other:?}"))),
        };
        if fields.next().is_some() {
            exn::bail!(ErrorKind::Parse(format!("trailing fields after {kind} record")));
        }
        Ok(record)
    }
}
