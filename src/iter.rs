//! Iteration over the items of a run of chunks.
//!
//! Used by compaction to look ahead across chunk boundaries: the
//! [`MultiChunkIterator`] walks an engaged run's linked items in order,
//! following successor pointers between chunks. The chunks are frozen, so
//! the walk needs no synchronization beyond the guard that keeps them
//! alive.

use crate::chunk::{Chunk, NONE};
use crate::key::Key;

/// Iterator over the items of a contiguous run of chunks.
///
/// Positions are `(chunk, order index)` pairs; [`MultiChunkIterator::next`]
/// advances to the following item, hopping to the next non-empty chunk at
/// a boundary.
pub struct MultiChunkIterator<'a, K, V> {
    chunks: &'a [*mut Chunk<K, V>],
    /// Index into `chunks` of the chunk being walked.
    at: usize,
    /// Current order index inside the current chunk; [`NONE`] = before the
    /// first item.
    curr: u32,
}

impl<'a, K: Key, V: Clone> MultiChunkIterator<'a, K, V> {
    /// Iterate the run starting at `oi` inside the first chunk.
    ///
    /// # Panics
    ///
    /// Panics on an empty run; engaged runs always hold at least one chunk.
    pub(crate) fn from_position(oi: u32, chunks: &'a [*mut Chunk<K, V>]) -> Self {
        assert!(!chunks.is_empty(), "iterator needs at least one chunk");
        Self {
            chunks,
            at: 0,
            curr: oi,
        }
    }

    fn chunk(&self) -> &'a Chunk<K, V> {
        // SAFETY: engaged chunks are kept alive by the caller's guard for
        // the iterator's lifetime.
        unsafe { &*self.chunks[self.at] }
    }

    /// Whether another item exists in the run.
    pub(crate) fn has_next(&self) -> bool {
        if self.chunk().next_of(self.curr) != NONE {
            return true;
        }
        self.peek_next_chunk().is_some()
    }

    /// Index (into the run) of the next chunk holding any item.
    fn peek_next_chunk(&self) -> Option<usize> {
        ((self.at + 1)..self.chunks.len()).find(|&i| {
            // SAFETY: see `chunk`.
            let c = unsafe { &*self.chunks[i] };
            c.first_item() != NONE
        })
    }

    /// Advance to the next item. After `next` the current key, value, and
    /// version can be fetched.
    ///
    /// # Panics
    ///
    /// Panics when called without a next item; guard with
    /// [`Self::has_next`].
    pub(crate) fn next(&mut self) {
        let within = self.chunk().next_of(self.curr);
        if within != NONE {
            self.curr = within;
            return;
        }

        let at = self.peek_next_chunk().expect("next() past end of run");
        self.at = at;
        self.curr = self.chunk().first_item();
    }

    /// Key of the current item.
    pub(crate) fn key(&self) -> K {
        self.chunk().key_at(self.curr)
    }

    /// Value of the current item (`None` for a tombstone).
    pub(crate) fn value(&self) -> Option<V> {
        self.chunk().get_data(self.curr)
    }

    /// Version of the current item.
    pub(crate) fn version(&self) -> i32 {
        self.chunk().version_of(self.curr)
    }
}
