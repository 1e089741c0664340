//! Sparse storage for per-shard rows over the full shard domain.

use crate::hash::{SHARD_BITS, SHARD_COUNT};

const PAGE_BITS: u32 = SHARD_BITS / 2;
const PAGE_ROWS: usize = 1 << PAGE_BITS;
const PAGE_COUNT: usize = SHARD_COUNT / PAGE_ROWS;
const ROW_MASK: usize = PAGE_ROWS - 1;

/// One row per shard, allocated a page (4096 rows) at a time on first use.
///
/// Most of the domain stays unallocated for sparse indexes, while lookups
/// remain two array indexings.
pub(crate) struct ShardDirectory<T> {
    pages: Box<[Option<Box<[T]>>]>,
}

impl<T: Default> ShardDirectory<T> {
    pub(crate) fn new() -> Self {
        Self { pages: (0..PAGE_COUNT).map(|_| None).collect() }
    }

    fn locate(shard: u32) -> (usize, usize) {
        let shard = shard as usize & (SHARD_COUNT - 1);
        (shard >> PAGE_BITS, shard & ROW_MASK)
    }

    pub(crate) fn get(&self, shard: u32) -> Option<&T> {
        let (page, row) = Self::locate(shard);
        self.pages[page].as_ref().map(|rows| &rows[row])
    }

    pub(crate) fn get_mut(&mut self, shard: u32) -> Option<&mut T> {
        let (page, row) = Self::locate(shard);
        self.pages[page].as_mut().map(|rows| &mut rows[row])
    }

    pub(crate) fn get_or_default(&mut self, shard: u32) -> &mut T {
        let (page, row) = Self::locate(shard);
        let rows = self.pages[page].get_or_insert_with(|| (0..PAGE_ROWS).map(|_| T::default()).collect());
        &mut rows[row]
    }

    #[cfg(test)]
    pub(crate) fn allocated_pages(&self) -> usize {
        self.pages.iter().filter(|page| page.is_some()).count()
    }
}
