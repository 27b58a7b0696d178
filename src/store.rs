//! The top-level KiWi store.
//!
//! Holds the navigation index, the chunk chain, the global version counter,
//! and the published-scan table, and drives the rebalance path. Operations
//! locate a candidate chunk through the index `floor`, then walk successor
//! references to the exact chunk owning the key - index entries can lag
//! behind splits, and that is fine because the index is always updated
//! *after* the chain.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicPtr};

use crossbeam_utils::CachePadded;
use rand::Rng;
use seize::{Collector, Guard, LocalGuard};

use crate::chunk::{Chunk, FIRST_VERSION, FROZEN_VERSION, NONE, UNSET};
use crate::config::Config;
use crate::index::NavIndex;
use crate::key::Key;
use crate::ordering::PROTOCOL;
use crate::rebalance::{ChunkChain, Rebalancer};
use crate::scan::{ScanData, ScanIndex};
use crate::tracing_helpers::trace_log;
use crate::worker::WorkerSet;

#[cfg(all(test, loom))]
mod loom_tests;

/// Reclaim a chunk retired after compaction (seize callback).
///
/// # Safety
///
/// `ptr` must come from `Box::into_raw` and be unreachable by new
/// traversals; seize guarantees no reader still holds it.
unsafe fn reclaim_chunk<K: Key, V>(ptr: *mut Chunk<K, V>, _collector: &Collector) {
    // SAFETY: caller contract above.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Reclaim a cleared scan descriptor (seize callback).
///
/// # Safety
///
/// Same contract as [`reclaim_chunk`].
unsafe fn reclaim_scan_data<K>(ptr: *mut ScanData<K>, _collector: &Collector) {
    // SAFETY: caller contract above.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Outcome of one chain-splice attempt.
enum Splice<K, V> {
    /// The compacted range is reachable from the chain (by us or a helper).
    Done,
    /// The predecessor is itself frozen; it must be rebalanced first.
    BlockedOn(*mut Chunk<K, V>),
}

/// A lock-free, in-memory, ordered key-value store.
///
/// See the crate docs for the full semantics. All methods take `&self` and
/// are safe to call from up to [`Config::max_workers`] threads
/// concurrently.
#[derive(Debug)]
pub struct KiWi<K: Key, V> {
    config: Config,
    index: NavIndex<K, V>,

    /// Next version to hand out. Versions order all updates; scans bump the
    /// counter, puts share whatever value is current.
    version: AtomicI32,

    /// Published in-flight scans, one slot per worker. `None` when the
    /// store was built without scan support.
    scan_slots: Option<Box<[CachePadded<AtomicPtr<ScanData<K>>>]>>,

    workers: Arc<WorkerSet>,
    collector: Collector,
}

impl<K: Key, V: Clone + Send + Sync + 'static> KiWi<K, V> {
    /// Create a store from `config`.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid (see [`Config::validate`]).
    #[must_use]
    pub fn new(config: Config) -> Self {
        config.validate();

        let head = Chunk::new(
            K::MIN,
            config.chunk_capacity,
            config.max_workers,
            config.allow_duplicates,
            ptr::null_mut(),
        );

        let index = NavIndex::new();
        index.insert(K::MIN, Box::into_raw(head));

        let scan_slots = config.scan_support.then(|| {
            (0..config.max_workers)
                .map(|_| CachePadded::new(AtomicPtr::new(ptr::null_mut())))
                .collect()
        });

        Self {
            workers: WorkerSet::new(config.max_workers),
            config,
            index,
            version: AtomicI32::new(FIRST_VERSION),
            scan_slots,
            collector: Collector::new(),
        }
    }

    /// Enter a protected region; chunk pointers loaded under the returned
    /// guard stay valid until it drops.
    fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    // ========================================================================
    //  Public operations
    // ========================================================================

    /// Linearizable point lookup. Returns `None` for absent and deleted
    /// keys alike.
    pub fn get(&self, key: K) -> Option<V> {
        let guard = self.guard();

        let c = self.locate_chunk(key, &guard);
        // SAFETY: chunk pointers are protected by `guard`.
        let c = unsafe { &*c };

        // Help concurrent put operations set a version, then resolve.
        let pending = c.help_put_in_get(self.version.load(PROTOCOL), key);
        c.find(key, pending)
    }

    /// Insert or overwrite `key`. `None` records a tombstone (logical
    /// deletion); there is no distinct insert-if-absent.
    pub fn put(&self, key: K, value: Option<V>) {
        let guard = self.guard();
        let worker = self.workers.current_slot();

        let mut c = self.locate_chunk(key, &guard);

        // Repeat until the put lands in a live chunk.
        loop {
            c = self.iterate_chunks(c, key);
            // SAFETY: chunk pointers are protected by `guard`.
            let chunk = unsafe { &*c };

            // An infant chunk routes through its parent: help finish the
            // parent's rebalance first, then retry against the result.
            let parent = chunk.creator();
            if !parent.is_null() {
                self.rebalance(parent, &guard);
                continue;
            }

            let Ok(oi) = chunk.allocate(key, value.as_ref()) else {
                c = self.rebalance(c, &guard);
                continue;
            };

            if self.config.scan_support {
                // Publish before tagging the version so scans and freezes
                // can see this write and help it, which is what keeps a
                // concurrent scan from missing a write it must include.
                chunk.publish_put(worker, oi);

                if chunk.is_frozen() && chunk.try_freeze_item(oi) {
                    // The slot is unreachable in this chunk; reinsert in
                    // the rebalanced one.
                    chunk.publish_put(worker, NONE);
                    c = self.rebalance(c, &guard);
                    continue;
                }
            }

            // Use whatever version is successfully set, by self or by a
            // helper. The counter is read, not incremented: concurrent
            // writers may share a version.
            let my_version =
                chunk.set_version(oi, self.version.load(PROTOCOL));

            if my_version == FROZEN_VERSION {
                // A freeze got the slot first.
                if self.config.scan_support {
                    chunk.publish_put(worker, NONE);
                }
                c = self.rebalance(c, &guard);
                continue;
            }

            chunk.add_to_list(oi, key);

            if self.config.scan_support {
                chunk.publish_put(worker, NONE);
            }

            if self.should_rebalance(chunk) {
                self.rebalance(c, &guard);
            }

            return;
        }
    }

    /// Snapshot-consistent range scan: fills `out` with up to `out.len()`
    /// live values for keys in `[min, max]` as of a single version, in
    /// ascending key order. Returns the count written.
    ///
    /// # Panics
    ///
    /// Panics if the store was built with scan support disabled.
    pub fn scan(&self, min: K, max: K, out: &mut [V]) -> usize {
        assert!(
            self.config.scan_support,
            "scan called on a store built without scan support"
        );
        if min > max {
            return 0;
        }

        let guard = self.guard();
        let worker = self.workers.current_slot();

        let my_version = self.new_version(min, max, worker);

        let mut count = 0_usize;
        let mut c = self.locate_chunk(min, &guard);

        while !c.is_null() {
            // SAFETY: chunk pointers are protected by `guard`.
            let chunk = unsafe { &*c };
            if chunk.min_key() > max {
                break;
            }

            // Help pending puts in range take a version so this scan's
            // snapshot cannot be perforated after the fact.
            let pending = chunk.help_put_in_scan(my_version, min, max);
            count += chunk.copy_values_into(&mut out[count..], my_version, min, max, &pending);

            if count == out.len() {
                break;
            }
            c = chunk.next_unmarked();
        }

        self.clear_scan(worker, &guard);
        count
    }

    // ========================================================================
    //  Version / scan coordination
    // ========================================================================

    /// Publish a scan descriptor and take a version for it.
    ///
    /// Publication precedes the counter bump so concurrent compactions are
    /// aware of this scan; the first CAS on the descriptor wins, and a
    /// helper's value is honored.
    fn new_version(&self, min: K, max: K, worker: usize) -> i32 {
        let slots = self.scan_slots.as_ref().expect("scan support enabled");

        let sd = Box::into_raw(Box::new(ScanData::new(min, max)));
        let old = slots[worker].swap(sd, PROTOCOL);
        debug_assert!(old.is_null(), "scan slot was not cleared");

        let my_version = self.version.fetch_add(1, PROTOCOL);
        // SAFETY: sd stays alive until cleared + retired.
        unsafe { &*sd }.assign_version(my_version)
    }

    /// Clear the calling worker's scan descriptor, retiring it once no
    /// helper can still be reading it.
    fn clear_scan(&self, worker: usize, guard: &LocalGuard<'_>) {
        let slots = self.scan_slots.as_ref().expect("scan support enabled");
        let old = slots[worker].swap(ptr::null_mut(), PROTOCOL);
        if !old.is_null() {
            // SAFETY: the descriptor came from Box::into_raw and is now
            // unreachable from the slot.
            unsafe { guard.defer_retire(old, reclaim_scan_data) };
        }
    }

    /// Snapshot the active scans intersecting the engaged range, helping
    /// published-but-unversioned scans to a version first. The counter is
    /// incremented at most once per pass.
    fn collect_scan_index(&self, engaged: &[*mut Chunk<K, V>]) -> ScanIndex<K> {
        let Some(slots) = self.scan_slots.as_ref() else {
            return ScanIndex::empty();
        };

        // SAFETY: engaged chunks are protected by the caller's guard.
        let range_min = unsafe { &*engaged[0] }.min_key();
        let next_to_range = unsafe { &*engaged[engaged.len() - 1] }.next_unmarked();
        let range_max = if next_to_range.is_null() {
            None
        } else {
            // SAFETY: see above.
            Some(unsafe { &*next_to_range }.min_key())
        };

        let mut helped_version: Option<i32> = None;
        let mut scans = Vec::new();

        for slot in slots.iter() {
            let p = slot.load(PROTOCOL);
            if p.is_null() {
                continue;
            }
            // SAFETY: descriptors are retired through the collector, and we
            // hold a guard.
            let sd = unsafe { &*p };

            if sd.version() == UNSET {
                // Increment only once, even if several scans need helping.
                let v = *helped_version
                    .get_or_insert_with(|| self.version.fetch_add(1, PROTOCOL));
                sd.assign_version(v);
            }

            scans.push((sd.version(), sd.min, sd.max));
        }

        ScanIndex::new(scans, range_min, range_max)
    }

    // ========================================================================
    //  Chunk location
    // ========================================================================

    /// Index floor, retried over the momentary gap a same-key replacement
    /// can open, then successor walk to the owning chunk.
    fn locate_chunk(&self, key: K, _guard: &LocalGuard<'_>) -> *mut Chunk<K, V> {
        loop {
            let c = self.index.floor(key);
            if !c.is_null() {
                return self.iterate_chunks(c, key);
            }
            std::hint::spin_loop();
        }
    }

    /// Walk successors from `c` to the last chunk whose `min_key <= key`.
    fn iterate_chunks(&self, mut c: *mut Chunk<K, V>, key: K) -> *mut Chunk<K, V> {
        loop {
            // SAFETY: chain pointers are protected by the caller's guard.
            let next = unsafe { &*c }.next_unmarked();
            if next.is_null() || unsafe { &*next }.min_key() > key {
                return c;
            }
            c = next;
        }
    }

    // ========================================================================
    //  Rebalancing
    // ========================================================================

    /// Whether a successful put should opportunistically trigger a
    /// rebalance of `chunk`. Probabilistic, to bound overhead.
    fn should_rebalance(&self, chunk: &Chunk<K, V>) -> bool {
        if rand::rng().random_range(0..100_u32) > self.config.rebalance_prob_pct {
            return false;
        }
        // Another thread already runs a rebalance here.
        if !chunk.is_engaged(None) {
            return false;
        }

        let items = chunk.filled_count() as usize;
        let sorted = chunk.sorted_count() as usize;

        (sorted == 0 && items << 3 > self.config.chunk_capacity)
            || (sorted > 0
                && (sorted as f64 * self.config.sorted_rebalance_ratio) < items as f64)
    }

    /// Rebalance `chunk`'s range: engage, freeze, compact, splice into the
    /// chain and index, retire the replaced chunks. Returns the first
    /// compacted chunk so the caller can retry its operation against it.
    ///
    /// A frozen predecessor discovered while splicing is handled through an
    /// explicit work list rather than recursion, so adversarial chains of
    /// consecutive splits cannot grow the stack.
    fn rebalance(&self, chunk: *mut Chunk<K, V>, guard: &LocalGuard<'_>) -> *mut Chunk<K, V> {
        let mut work = vec![chunk];

        while let Some(target) = work.pop() {
            let r = Rebalancer::new(target);
            let r = r.engage_chunks(self, &self.config);

            // Freeze the engaged range: all updates on it are redirected to
            // helping this rebalance from here on.
            r.freeze();

            if !r.is_compacted() {
                let mut scan_index = self.collect_scan_index(r.engaged());
                r.compact(&mut scan_index, &self.config);
            }

            let engaged = r.engaged();
            let compacted = r.compacted();

            match self.connect_to_chunk_list(engaged, compacted) {
                Splice::Done => {
                    self.update_index(engaged, compacted);

                    if r.claim_retire() {
                        trace_log!(retired = engaged.len(), "retiring engaged range");
                        for &e in engaged {
                            // SAFETY: the engaged chunks are unreachable
                            // from the index and from live predecessors;
                            // in-flight readers are covered by their
                            // guards.
                            unsafe { guard.defer_retire(e, reclaim_chunk) };
                        }
                    }
                }
                Splice::BlockedOn(prev) => {
                    // Finish the predecessor's rebalance first, then come
                    // back to this range.
                    work.push(target);
                    work.push(prev);
                }
            }
        }

        // SAFETY: `chunk` is engaged and protected by `guard`; its
        // rebalancer published a compaction before the work list drained.
        let r = unsafe { &*chunk }
            .rebalancer_arc()
            .expect("rebalanced chunk has an owner");
        r.compacted()[0]
    }

    /// Splice the compacted range into the chunk chain in place of the
    /// engaged range.
    fn connect_to_chunk_list(
        &self,
        engaged: &[*mut Chunk<K, V>],
        compacted: &[*mut Chunk<K, V>],
    ) -> Splice<K, V> {
        Self::update_last_child(engaged, compacted);

        let first_engaged = engaged[0];
        // SAFETY: engaged chunks are protected by the caller's guard.
        let first_min = unsafe { &*first_engaged }.min_key();

        loop {
            // Find the predecessor of the engaged range, preferring the
            // index and falling back to a head walk when the index lags.
            let mut prev = self.index.lower(first_min).unwrap_or(ptr::null_mut());
            let mut curr = if prev.is_null() {
                ptr::null_mut()
            } else {
                // SAFETY: see above.
                unsafe { &*prev }.next_unmarked()
            };

            if prev.is_null() || !ptr::eq(curr, first_engaged) {
                prev = ptr::null_mut();
                curr = self.index.first();
                while !curr.is_null() && !ptr::eq(curr, first_engaged) {
                    prev = curr;
                    // SAFETY: see above.
                    curr = unsafe { &*curr }.next_unmarked();
                }
            }

            // Range is the head, or already unlinked by a helper.
            if curr.is_null() || prev.is_null() {
                return Splice::Done;
            }

            // SAFETY: see above.
            let prev_ref = unsafe { &*prev };

            // A marked predecessor is itself superseded; it must be
            // replaced before we can hang anything off it.
            if prev_ref.next_is_marked() {
                return Splice::BlockedOn(prev);
            }

            if prev_ref.cas_next(first_engaged, compacted[0]) || !prev_ref.next_is_marked() {
                // Either we spliced, or a helper did: the CAS can only fail
                // with an unmarked pointer if the successor already moved
                // off the engaged range.
                return Splice::Done;
            }
        }
    }

    /// Hook the last compacted chunk onto whatever follows the engaged
    /// range, fixing the range's tail in place first.
    fn update_last_child(engaged: &[*mut Chunk<K, V>], compacted: &[*mut Chunk<K, V>]) {
        // SAFETY: both slices hold guard-protected chunks.
        let last_engaged = unsafe { &*engaged[engaged.len() - 1] };
        let next_to_last = last_engaged.mark_and_get_next();

        let last_child = unsafe { &*compacted[compacted.len() - 1] };
        last_child.cas_next(ptr::null_mut(), next_to_last);
    }

    /// Publish the compacted range into the navigation index and clear the
    /// infant markers.
    fn update_index(&self, engaged: &[*mut Chunk<K, V>], compacted: &[*mut Chunk<K, V>]) {
        let first_engaged = engaged[0];
        let first_compacted = compacted[0];
        // SAFETY: all chunks here are guard-protected.
        let first_min = unsafe { &*first_engaged }.min_key();

        self.index.replace_if(first_min, first_engaged, first_compacted);

        // From infant to normal. The Release store orders after the index
        // linkage above; readers treating infant status as "route to the
        // parent" observe reachability first.
        unsafe { &*first_compacted }.clear_creator();

        // Remove the rest of the engaged range from the index; the
        // compacted chunks remain reachable through the first entry.
        for &e in &engaged[1..] {
            // SAFETY: see above.
            self.index.remove_if(unsafe { &*e }.min_key(), e);
        }

        // Publish the remaining compacted chunks. The per-chunk lock keeps
        // a racing helper from double-inserting around the identity check.
        for &c in &compacted[1..] {
            // SAFETY: see above.
            let chunk = unsafe { &*c };
            chunk.with_publish_lock(|| {
                self.index.insert_if_absent(chunk.min_key(), c);
                chunk.clear_creator();
            });
        }
    }
}

impl<K: Key, V: Clone + Send + Sync> ChunkChain<K, V> for KiWi<K, V> {
    fn chain_next(&self, chunk: &Chunk<K, V>) -> *mut Chunk<K, V> {
        chunk.next_unmarked()
    }

    fn chain_prev(&self, chunk: &Chunk<K, V>) -> *mut Chunk<K, V> {
        let target = ptr::from_ref(chunk).cast_mut();
        let Some(mut prev) = self.index.lower(chunk.min_key()) else {
            return ptr::null_mut();
        };

        loop {
            // SAFETY: chain pointers are protected by the caller's guard.
            let next = unsafe { &*prev }.next_unmarked();
            if ptr::eq(next, target) {
                return prev;
            }
            if next.is_null() {
                return ptr::null_mut();
            }
            prev = next;
        }
    }
}

impl<K: Key, V> Drop for KiWi<K, V> {
    fn drop(&mut self) {
        // Tear down the live chain; retired chunks belong to the collector.
        let mut c = self.index.first();
        while !c.is_null() {
            // SAFETY: at drop time no other thread touches the store; every
            // live chunk is owned by the chain exactly once.
            let next = unsafe { &*c }.next_unmarked();
            unsafe { drop(Box::from_raw(c)) };
            c = next;
        }

        // Free descriptors of scans that never completed (leaked guards).
        if let Some(slots) = &self.scan_slots {
            for slot in slots.iter() {
                let p = slot.swap(ptr::null_mut(), PROTOCOL);
                if !p.is_null() {
                    // SAFETY: exclusive access at drop time.
                    unsafe { drop(Box::from_raw(p)) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store() -> KiWi<u64, u64> {
        // Tiny chunks force constant rebalancing.
        KiWi::new(
            Config::default()
                .with_chunk_capacity(32)
                .with_max_workers(4)
                .with_rebalance_prob_pct(100),
        )
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = small_store();

        store.put(1, Some(10));
        store.put(2, Some(20));

        assert_eq!(store.get(1), Some(10));
        assert_eq!(store.get(2), Some(20));
        assert_eq!(store.get(3), None);
    }

    #[test]
    fn test_overwrite_returns_latest() {
        let store = small_store();

        store.put(1, Some(10));
        store.put(1, Some(11));
        store.put(1, Some(12));

        assert_eq!(store.get(1), Some(12));
    }

    #[test]
    fn test_tombstone_hides_key() {
        let store = small_store();

        store.put(1, Some(10));
        store.put(1, None);

        assert_eq!(store.get(1), None);

        let mut out = vec![0u64; 4];
        assert_eq!(store.scan(0, 10, &mut out), 0);
    }

    #[test]
    fn test_capacity_burst_triggers_rebalance() {
        let store = small_store();

        // Far beyond one chunk's capacity: splits must keep everything.
        for k in 0..1000u64 {
            store.put(k, Some(k * 2));
        }
        for k in 0..1000u64 {
            assert_eq!(store.get(k), Some(k * 2), "key {k} lost");
        }
    }

    #[test]
    fn test_scan_returns_sorted_snapshot() {
        let store = small_store();

        for k in (0..100u64).rev() {
            store.put(k, Some(k + 1));
        }

        let mut out = vec![0u64; 128];
        let n = store.scan(10, 19, &mut out);

        assert_eq!(&out[..n], &(11..=20).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_scan_empty_and_degenerate_ranges() {
        let store = small_store();
        store.put(5, Some(50));

        let mut out = vec![0u64; 8];
        assert_eq!(store.scan(10, 20, &mut out), 0);
        assert_eq!(store.scan(20, 10, &mut out), 0);
        assert_eq!(store.scan(0, u64::MAX, &mut out), 1);
        assert_eq!(store.scan(5, 5, &mut out), 1);
        assert_eq!(out[0], 50);
    }

    #[test]
    fn test_scan_stops_at_buffer_capacity() {
        let store = small_store();
        for k in 0..50u64 {
            store.put(k, Some(k));
        }

        let mut out = vec![0u64; 10];
        assert_eq!(store.scan(0, 49, &mut out), 10);
        assert_eq!(&out[..], &(0..10).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_delete_range_then_scan() {
        let store = small_store();

        for k in 0..200u64 {
            store.put(k, Some(k));
        }
        for k in 0..100u64 {
            store.put(k, None);
        }

        let mut out = vec![0u64; 256];
        let n = store.scan(0, 199, &mut out);
        assert_eq!(&out[..n], &(100..200).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_scanless_store_still_serves_gets() {
        let store: KiWi<u64, u64> = KiWi::new(
            Config::default()
                .with_chunk_capacity(32)
                .with_max_workers(2)
                .with_scan_support(false)
                .with_rebalance_prob_pct(100),
        );

        for k in 0..300u64 {
            store.put(k, Some(k));
        }
        for k in 0..300u64 {
            assert_eq!(store.get(k), Some(k));
        }
    }

    #[test]
    #[should_panic(expected = "without scan support")]
    fn test_scan_on_scanless_store_panics() {
        let store: KiWi<u64, u64> =
            KiWi::new(Config::default().with_scan_support(false));
        let mut out = vec![0u64; 1];
        store.scan(0, 1, &mut out);
    }

    #[test]
    fn test_signed_keys() {
        let store: KiWi<i64, u64> = KiWi::new(Config::default().with_chunk_capacity(32));

        store.put(-5, Some(1));
        store.put(0, Some(2));
        store.put(5, Some(3));

        assert_eq!(store.get(-5), Some(1));

        let mut out = vec![0u64; 8];
        let n = store.scan(i64::MIN, i64::MAX, &mut out);
        assert_eq!(&out[..n], &[1, 2, 3]);
    }
}
