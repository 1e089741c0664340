//! Content hashes and how they split into shard and residual.

use crate::error::{Error, ErrorKind, Result};
use exn::ResultExt;
use std::fmt;
use std::str::FromStr;

/// Bits of a hash that select its shard.
pub const SHARD_BITS: u32 = 24;
/// Bits of a hash stored in the slot itself.
pub const RESIDUAL_BITS: u32 = u64::BITS - SHARD_BITS;
/// Number of shards in the hash domain.
pub const SHARD_COUNT: usize = 1 << SHARD_BITS;

const RESIDUAL_MASK: u64 = (1 << RESIDUAL_BITS) - 1;

/// A 64-bit content fingerprint produced by a caller.
///
/// The high 24 bits select the shard, the low 40 bits (the residual) are what
/// the shard row actually stores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(u64);

impl ContentHash {
    pub const fn new(hash: u64) -> Self {
        Self(hash)
    }

    pub const fn from_parts(shard: u32, residual: u64) -> Self {
        Self(((shard as u64) << RESIDUAL_BITS) | (residual & RESIDUAL_MASK))
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn shard(self) -> u32 {
        (self.0 >> RESIDUAL_BITS) as u32
    }

    pub const fn residual(self) -> u64 {
        self.0 & RESIDUAL_MASK
    }
}

impl From<u64> for ContentHash {
    fn from(hash: u64) -> Self {
        Self(hash)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Parses 1-16 hex digits, with or without a `0x` prefix.
impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.is_empty() || digits.len() > 16 {
            exn::bail!(ErrorKind::InvalidHash(s.to_string()));
        }
        u64::from_str_radix(digits, 16).map(Self).or_raise(|| ErrorKind::InvalidHash(s.to_string()))
    }
}

/// The secondary key of a payload: the first 8 bytes (little endian) of its
/// BLAKE3 digest.
pub fn dedup_hash(payload: &[u8]) -> u64 {
    let digest = blake3::hash(payload);
    let mut prefix = [0; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}
