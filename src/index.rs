//! Navigation index: ordered map from minimum key to chunk.
//!
//! A thin wrapper over `crossbeam-skiplist`'s `SkipMap`, consumed only
//! through floor/lower/first/replace/remove/insert-if-absent. The index is
//! advisory: it may transiently lag behind the chunk chain during splits,
//! and readers recover by walking successor pointers. It is always updated
//! *after* the chain, never before.

use crossbeam_skiplist::SkipMap;

use crate::chunk::Chunk;
use crate::key::Key;

/// A chunk pointer stored as an index value.
///
/// Identity comparisons (replace/remove guards) are by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef<K, V>(pub(crate) *mut Chunk<K, V>);

// SAFETY: the pointee is a Sync chunk whose lifetime is managed by the
// store (seize retirement / chain teardown), never through this handle.
unsafe impl<K: Key, V: Send> Send for ChunkRef<K, V> {}
// SAFETY: see above.
unsafe impl<K: Key, V: Send + Sync> Sync for ChunkRef<K, V> {}

/// Ordered concurrent mapping from `min_key` to chunk.
#[derive(Debug)]
pub struct NavIndex<K: Key, V> {
    map: SkipMap<K, ChunkRef<K, V>>,
}

// Read-side operations only need the key order (mirrors the skip list's
// own bound structure, so `KiWi::drop` can walk the chain without value
// bounds).
impl<K: Key, V> NavIndex<K, V> {
    pub(crate) fn new() -> Self {
        Self { map: SkipMap::new() }
    }

    /// The chunk covering the greatest `min_key <= key`, falling back to
    /// the first entry (the index is never empty: the head chunk covers
    /// the whole key space).
    pub(crate) fn floor(&self, key: K) -> *mut Chunk<K, V> {
        self.map
            .range(..=key)
            .next_back()
            .or_else(|| self.map.front())
            .map_or(std::ptr::null_mut(), |e| e.value().0)
    }

    /// The chunk with the greatest `min_key` strictly below `key`, if any.
    pub(crate) fn lower(&self, key: K) -> Option<*mut Chunk<K, V>> {
        self.map.range(..key).next_back().map(|e| e.value().0)
    }

    /// The chunk with the smallest `min_key`.
    pub(crate) fn first(&self) -> *mut Chunk<K, V> {
        self.map
            .front()
            .map_or(std::ptr::null_mut(), |e| e.value().0)
    }
}

impl<K: Key, V: Send + Sync + 'static> NavIndex<K, V> {
    /// Insert unconditionally. Only used for the head chunk at store
    /// construction.
    pub(crate) fn insert(&self, min_key: K, chunk: *mut Chunk<K, V>) {
        self.map.insert(min_key, ChunkRef(chunk));
    }

    /// Replace the entry at `min_key` with `new`, but only while it still
    /// holds `old`. A no-op when a helper already performed the swap.
    pub(crate) fn replace_if(&self, min_key: K, old: *mut Chunk<K, V>, new: *mut Chunk<K, V>) {
        self.map
            .compare_insert(min_key, ChunkRef(new), |current| current.0 == old);
    }

    /// Remove the entry at `min_key`, but only while it still holds `old`.
    pub(crate) fn remove_if(&self, min_key: K, old: *mut Chunk<K, V>) {
        if let Some(entry) = self.map.get(&min_key) {
            if entry.value().0 == old {
                // Entry removal is identity-based: a racing insert of a new
                // chunk under the same key is left untouched.
                entry.remove();
            }
        }
    }

    /// Insert unless the key is already present.
    pub(crate) fn insert_if_absent(&self, min_key: K, chunk: *mut Chunk<K, V>) {
        self.map
            .compare_insert(min_key, ChunkRef(chunk), |_| false);
    }
}
