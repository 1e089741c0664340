//! Fixed-size serving slots.

use derive_more::Display;

/// Size of one packed slot: residual (5) + tag (1) + aux (4) + seq (4).
pub const SLOT_BYTES: usize = 14;

const RESIDUAL_BYTES: usize = 5;

/// Which part of its shard row a slot lives in.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Section {
    /// Keyed by the hash of the normalized text itself.
    #[display("primary")]
    Primary,
    /// Keyed by a hash derived from it.
    #[display("derived")]
    Derived,
}

/// One entry of a shard row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Slot {
    /// Low 40 bits of the content hash.
    pub residual: u64,
    /// Small disambiguator, such as the length of an author fingerprint.
    pub tag: u8,
    /// Auxiliary fingerprint, such as an author hash.
    pub aux: u32,
    /// Process-wide insertion sequence number.
    pub seq: u32,
}

impl Slot {
    /// `residual (5 bytes LE) | tag | aux (LE) | seq (LE)`
    pub fn to_bytes(&self) -> [u8; SLOT_BYTES] {
        let mut bytes = [0; SLOT_BYTES];
        bytes[..5].copy_from_slice(&self.residual.to_le_bytes()[..RESIDUAL_BYTES]);
        bytes[5] = self.tag;
        bytes[6..10].copy_from_slice(&self.aux.to_le_bytes());
        bytes[10..].copy_from_slice(&self.seq.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; SLOT_BYTES]) -> Self {
        let mut residual = [0; 8];
        residual[..RESIDUAL_BYTES].copy_from_slice(&bytes[..5]);
        let [_, _, _, _, _, tag, a0, a1, a2, a3, s0, s1, s2, s3] = *bytes;
        Self {
            residual: u64::from_le_bytes(residual),
            tag,
            aux: u32::from_le_bytes([a0, a1, a2, a3]),
            seq: u32::from_le_bytes([s0, s1, s2, s3]),
        }
    }

    /// Whether this slot carries the given identity (everything but `seq`).
    pub(crate) fn is(&self, residual: u64, fields: &SlotFields) -> bool {
        self.residual == residual && self.tag == fields.tag && self.aux == fields.aux
    }
}

/// The caller-supplied part of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotFields {
    pub section: Section,
    pub tag: u8,
    pub aux: u32,
}

/// Stable address of a slot. Rows are append-only, so a `SlotRef` keeps
/// pointing at the same slot for the life of the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub shard: u32,
    pub section: Section,
    pub index: u32,
}

/// A copy of a slot together with where it lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotMatch {
    pub at: SlotRef,
    pub slot: Slot,
}
