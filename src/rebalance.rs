//! Rebalancer: claims a chunk range, freezes it, and drives compaction.
//!
//! One rebalancer represents one compaction attempt over a contiguous run
//! of chunks. Everything about it is helper-friendly: any number of threads
//! may push the same rebalancer through its stages concurrently, and every
//! stage is either idempotent (freeze) or first-writer-wins (engaged list,
//! compacted list, retirement), so all helpers converge on one outcome.
//!
//! Engagement claims chunks through a single CAS per chunk (at most one
//! owner ever, ABA-safe because chunks are never reused across rebalances)
//! and extends the claimed range forward and backward while each extension
//! would plausibly reduce the number of chunks left after the merge.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr};

use crate::chunk::Chunk;
use crate::compact;
use crate::config::Config;
use crate::key::Key;
use crate::once_ref::SetOnce;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, WRITE_ORD};
use crate::scan::ScanIndex;
use crate::tracing_helpers::debug_log;

/// Chain navigation the rebalancer needs from its host store.
///
/// `prev_of` may be approximate (it navigates through the possibly-lagging
/// index); the policy double-checks linkage before trusting it.
pub(crate) trait ChunkChain<K: Key, V> {
    /// Successor of `chunk` in the chain, or null at the tail.
    fn chain_next(&self, chunk: &Chunk<K, V>) -> *mut Chunk<K, V>;
    /// Predecessor of `chunk` in the chain, or null when unknown.
    fn chain_prev(&self, chunk: &Chunk<K, V>) -> *mut Chunk<K, V>;
}

/// One compaction attempt over a contiguous chunk range.
///
/// Transient: constructed per attempt, shared between helpers through the
/// chunks' owner slots, and dropped once the last reference (chunk slots
/// and stack borrows) goes away.
#[derive(Debug)]
pub struct Rebalancer<K, V> {
    /// Cursor of the cooperative engagement loop: the next chunk every
    /// helper tries to claim. Monotone: advances by CAS, ends at null.
    next_to_engage: AtomicPtr<Chunk<K, V>>,

    start: *mut Chunk<K, V>,

    /// Finalized engaged range, in chain order. Set exactly once.
    engaged: SetOnce<Vec<*mut Chunk<K, V>>>,

    /// Compaction result, in chain order. Set exactly once; losing
    /// compactions free their speculative chunks.
    compacted: SetOnce<Vec<*mut Chunk<K, V>>>,

    frozen: AtomicBool,

    /// Guards exactly-once retirement of the engaged chunks.
    retired: AtomicBool,
}

// SAFETY: the raw chunk pointers are owned by the store's chain/collector;
// all rebalancer state transitions are atomic.
unsafe impl<K: Key, V: Send> Send for Rebalancer<K, V> {}
// SAFETY: see above.
unsafe impl<K: Key, V: Send + Sync> Sync for Rebalancer<K, V> {}

impl<K: Key, V> Rebalancer<K, V> {
    /// Whether the compaction result has been published.
    ///
    /// Available for any `V` (no `Clone + Send + Sync` bound) so chain
    /// queries that only hold `V: Clone` can consult it.
    #[must_use]
    pub fn is_compacted(&self) -> bool {
        self.compacted.is_set()
    }
}

impl<K: Key, V: Clone + Send + Sync> Rebalancer<K, V> {
    /// Create a rebalancer starting from `chunk`.
    pub(crate) fn new(chunk: *mut Chunk<K, V>) -> Arc<Self> {
        debug_assert!(!chunk.is_null(), "rebalancer needs a start chunk");

        Arc::new(Self {
            next_to_engage: AtomicPtr::new(chunk),
            start: chunk,
            engaged: SetOnce::new(),
            compacted: SetOnce::new(),
            frozen: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        })
    }

    /// Run the cooperative engagement loop to completion.
    ///
    /// Returns the rebalancer that actually owns the start chunk: if this
    /// instance lost the race for its own start chunk it delegates entirely
    /// to the winner. The delegation cannot chain: the winner is engaged to
    /// the start chunk, so its own loop never delegates again.
    pub(crate) fn engage_chunks(
        self: &Arc<Self>,
        chain: &impl ChunkChain<K, V>,
        config: &Config,
    ) -> Arc<Self> {
        let mut policy = RangePolicy::new(self.start, config);

        loop {
            let next = self.next_to_engage.load(READ_ORD);
            if next.is_null() {
                break;
            }
            // SAFETY: chunks reachable through the engagement cursor are
            // protected by the operation's guard.
            let next_ref = unsafe { &*next };

            next_ref.engage(self);

            if !next_ref.is_engaged(Some(self)) && ptr::eq(next, self.start) {
                // Lost our own start chunk: the owner drives this range.
                let owner = next_ref
                    .rebalancer_arc()
                    .expect("engaged chunk has an owner");
                return owner.engage_chunks(chain, config);
            }

            // The policy caches the engaged interval [first, last] and
            // proposes the next unclaimed neighbor, or null to stop.
            let candidate = policy.find_next_candidate(self, chain);

            // A failed CAS means another helper advanced the cursor first;
            // loop around and try to engage whatever it chose.
            let _ = self.next_to_engage.compare_exchange(
                next,
                candidate,
                CAS_SUCCESS,
                CAS_FAILURE,
            );
        }

        policy.update_range_view(self, chain);
        let engaged = self.collect_engaged(policy.first);

        if self.engaged.set(Box::new(engaged)).is_ok() {
            debug_log!("engagement finalized");
        }

        Arc::clone(self)
    }

    fn collect_engaged(&self, first: *mut Chunk<K, V>) -> Vec<*mut Chunk<K, V>> {
        let mut engaged = Vec::new();
        let mut curr = first;

        while !curr.is_null() {
            // SAFETY: engaged chunks are guard-protected.
            let c = unsafe { &*curr };
            if !c.is_engaged(Some(self)) {
                break;
            }
            engaged.push(curr);
            curr = c.next_unmarked();
        }

        assert!(!engaged.is_empty(), "engaged range cannot be empty");
        engaged
    }

    /// Freeze the engaged chunks. Idempotent; racing callers converge on
    /// the same frozen state because per-item freezing is itself CAS-based.
    pub(crate) fn freeze(&self) {
        if self.is_frozen() {
            return;
        }

        for &c in self.engaged() {
            // SAFETY: engaged chunks are guard-protected.
            unsafe { &*c }.freeze();
        }

        self.frozen.store(true, WRITE_ORD);
    }

    /// Compact the engaged range, publishing the result exactly once. A
    /// racing helper that loses the publication frees its own chunks.
    pub(crate) fn compact(&self, scan_index: &mut ScanIndex<K>, config: &Config) {
        if self.is_compacted() {
            return;
        }

        let chunks = compact::compact(self.engaged(), scan_index, config);
        let raw: Vec<*mut Chunk<K, V>> = chunks.into_iter().map(Box::into_raw).collect();

        if let Err(rejected) = self.compacted.set(Box::new(raw)) {
            // Another helper published first - discard our speculative copy.
            for p in rejected.into_iter() {
                // SAFETY: these chunks came from Box::into_raw above and
                // were never published anywhere.
                unsafe { drop(Box::from_raw(p)) };
            }
        }
    }

    /// Whether the engaged range has been frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(READ_ORD)
    }

    /// The finalized engaged range.
    ///
    /// # Panics
    ///
    /// Panics if called before the engagement stage completed.
    pub(crate) fn engaged(&self) -> &[*mut Chunk<K, V>] {
        self.engaged
            .get()
            .expect("engaged range requested before engagement completed")
    }

    /// The published compaction result.
    ///
    /// # Panics
    ///
    /// Panics if called before the compaction stage completed.
    pub(crate) fn compacted(&self) -> &[*mut Chunk<K, V>] {
        self.compacted
            .get()
            .expect("compacted chunks requested before compaction completed")
    }

    /// Claim the exactly-once right to retire the engaged chunks.
    pub(crate) fn claim_retire(&self) -> bool {
        !self.retired.swap(true, CAS_SUCCESS)
    }
}

/// Greedy range-extension policy.
///
/// Extends the engaged interval toward whichever unclaimed, non-infant
/// neighbor is emptier, as long as the merged range still shrinks the
/// chunk count (estimated from per-chunk live-item counts).
struct RangePolicy<K, V> {
    first: *mut Chunk<K, V>,
    last: *mut Chunk<K, V>,
    chunks_in_range: usize,
    items_in_range: usize,
    max_after_merge_items: usize,
    rebalance_size: usize,
}

impl<K: Key, V: Clone + Send + Sync> RangePolicy<K, V> {
    fn new(start: *mut Chunk<K, V>, config: &Config) -> Self {
        debug_assert!(!start.is_null(), "policy needs a start chunk");
        // SAFETY: the start chunk is guard-protected.
        let start_ref = unsafe { &*start };

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        let max_after_merge_items =
            (config.chunk_capacity as f64 * config.max_after_merge_part) as usize;

        Self {
            first: start,
            last: start,
            chunks_in_range: 1,
            items_in_range: start_ref.compacted_count() as usize,
            max_after_merge_items: max_after_merge_items.max(1),
            rebalance_size: config.rebalance_size,
        }
    }

    /// A chunk can join the range if nobody claimed it and it is not an
    /// infant mid-publication.
    fn is_candidate(chunk: *mut Chunk<K, V>) -> bool {
        if chunk.is_null() {
            return false;
        }
        // SAFETY: candidate chunks come from chain navigation under guard.
        let c = unsafe { &*chunk };
        c.is_engaged(None) && !c.is_infant()
    }

    fn add_to_counters(&mut self, chunk: *mut Chunk<K, V>) {
        // SAFETY: engaged chunks are guard-protected.
        self.items_in_range += unsafe { &*chunk }.compacted_count() as usize;
        self.chunks_in_range += 1;
    }

    /// Re-sync `[first, last]` with what is actually engaged, in both
    /// directions.
    fn update_range_view(
        &mut self,
        owner: &Rebalancer<K, V>,
        chain: &impl ChunkChain<K, V>,
    ) {
        self.update_range_fwd(owner, chain);
        self.update_range_bwd(owner, chain);
    }

    fn update_range_fwd(&mut self, owner: &Rebalancer<K, V>, chain: &impl ChunkChain<K, V>) {
        loop {
            // SAFETY: see `add_to_counters`.
            let next = chain.chain_next(unsafe { &*self.last });
            if next.is_null() || !unsafe { &*next }.is_engaged(Some(owner)) {
                break;
            }
            self.last = next;
            self.add_to_counters(next);
        }
    }

    fn update_range_bwd(&mut self, owner: &Rebalancer<K, V>, chain: &impl ChunkChain<K, V>) {
        loop {
            // SAFETY: see `add_to_counters`.
            let prev = chain.chain_prev(unsafe { &*self.first });
            if prev.is_null() || !unsafe { &*prev }.is_engaged(Some(owner)) {
                break;
            }
            // Engaged chunks cannot move, but the backward walk navigated
            // the index - double-check the linkage before trusting it.
            if ptr::eq(unsafe { &*prev }.next_unmarked(), self.first) {
                self.first = prev;
                self.add_to_counters(prev);
            } else {
                break;
            }
        }
    }

    /// Propose the next chunk to claim, or null to finalize the range.
    fn find_next_candidate(
        &mut self,
        owner: &Rebalancer<K, V>,
        chain: &impl ChunkChain<K, V>,
    ) -> *mut Chunk<K, V> {
        self.update_range_view(owner, chain);

        if self.chunks_in_range >= self.rebalance_size {
            return ptr::null_mut();
        }

        // SAFETY: range endpoints are engaged, guard-protected chunks.
        let mut next = chain.chain_next(unsafe { &*self.last });
        let mut prev = chain.chain_prev(unsafe { &*self.first });

        if !Self::is_candidate(next) {
            next = ptr::null_mut();
        }
        if !Self::is_candidate(prev) {
            prev = ptr::null_mut();
        }

        let candidate = if next.is_null() && prev.is_null() {
            return ptr::null_mut();
        } else if next.is_null() {
            prev
        } else if prev.is_null() {
            next
        } else {
            // Prefer the emptier neighbor.
            // SAFETY: both are live chunks under guard.
            let prev_items = unsafe { &*prev }.compacted_count();
            let next_items = unsafe { &*next }.compacted_count();
            if prev_items < next_items { prev } else { next }
        };

        // SAFETY: candidate is non-null and guard-protected.
        let new_items = unsafe { &*candidate }.compacted_count() as usize;
        let total_items = self.items_in_range + new_items;
        let chunks_after_merge = total_items.div_ceil(self.max_after_merge_items);

        // Extend only while the merge would still reduce the chunk count.
        if chunks_after_merge < self.chunks_in_range + 1 {
            candidate
        } else {
            ptr::null_mut()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::NONE;

    struct TestChain {
        chunks: Vec<*mut Chunk<u64, u64>>,
    }

    impl TestChain {
        /// Build a linked run of chunks with the given live-item counts.
        fn new(counts: &[usize]) -> Self {
            let chunks: Vec<*mut Chunk<u64, u64>> = counts
                .iter()
                .enumerate()
                .map(|(i, &n)| {
                    let c: Box<Chunk<u64, u64>> =
                        Chunk::new(i as u64 * 1000, 64, 2, true, ptr::null_mut());
                    for k in 0..n as u64 {
                        let key = i as u64 * 1000 + k;
                        let oi = c.allocate(key, Some(&key)).unwrap();
                        c.set_version(oi, 2);
                        c.add_to_list(oi, key);
                    }
                    Box::into_raw(c)
                })
                .collect();

            for pair in chunks.windows(2) {
                // SAFETY: chunks are alive for the test's duration.
                unsafe { &*pair[0] }.set_next(pair[1]);
            }

            Self { chunks }
        }
    }

    impl Drop for TestChain {
        fn drop(&mut self) {
            for &p in &self.chunks {
                // SAFETY: p came from Box::into_raw in `new`.
                unsafe { drop(Box::from_raw(p)) };
            }
        }
    }

    impl ChunkChain<u64, u64> for TestChain {
        fn chain_next(&self, chunk: &Chunk<u64, u64>) -> *mut Chunk<u64, u64> {
            chunk.next_unmarked()
        }

        fn chain_prev(&self, chunk: &Chunk<u64, u64>) -> *mut Chunk<u64, u64> {
            let target = ptr::from_ref(chunk).cast_mut();
            self.chunks
                .iter()
                .copied()
                // SAFETY: chunks are alive for the test's duration.
                .find(|&c| ptr::eq(unsafe { &*c }.next_unmarked(), target))
                .unwrap_or(ptr::null_mut())
        }
    }

    fn config() -> Config {
        Config::default().with_chunk_capacity(64).with_max_workers(2)
    }

    #[test]
    fn test_engages_sparse_neighbor() {
        let chain = TestChain::new(&[4, 3, 60]);
        let config = config();

        let r = Rebalancer::new(chain.chunks[0]);
        let r = r.engage_chunks(&chain, &config);

        // The sparse middle chunk joins; the nearly-full one would not
        // shrink the chunk count.
        assert_eq!(r.engaged(), &chain.chunks[0..2]);
    }

    #[test]
    fn test_engagement_respects_rebalance_size() {
        let chain = TestChain::new(&[1, 1, 1, 1]);
        let config = config();
        assert_eq!(config.rebalance_size, 2);

        let r = Rebalancer::new(chain.chunks[1]);
        let r = r.engage_chunks(&chain, &config);

        assert_eq!(r.engaged().len(), 2);
    }

    #[test]
    fn test_losing_start_chunk_delegates() {
        let chain = TestChain::new(&[4, 4]);
        let config = config();

        let winner = Rebalancer::new(chain.chunks[0]);
        let winner = winner.engage_chunks(&chain, &config);

        let loser = Rebalancer::new(chain.chunks[0]);
        let resolved = loser.engage_chunks(&chain, &config);

        assert!(Arc::ptr_eq(&winner, &resolved));
        assert!(!loser.engaged.is_set());
    }

    #[test]
    fn test_freeze_and_compact_converge() {
        let chain = TestChain::new(&[4, 3]);
        let config = config();

        let r = Rebalancer::new(chain.chunks[0]);
        let r = r.engage_chunks(&chain, &config);
        r.freeze();
        assert!(r.is_frozen());

        let mut scan_index = ScanIndex::empty();
        r.compact(&mut scan_index, &config);
        assert!(r.is_compacted());

        let compacted = r.compacted().to_vec();
        assert_eq!(compacted.len(), 1);
        // SAFETY: the published chunk is alive until freed below.
        let merged = unsafe { &*compacted[0] };
        assert_eq!(merged.min_key(), 0);

        let mut count = 0;
        let mut oi = merged.first_item();
        while oi != NONE {
            count += 1;
            oi = merged.next_of(oi);
        }
        assert_eq!(count, 7);

        // A second compact call is a no-op.
        r.compact(&mut ScanIndex::empty(), &config);
        assert_eq!(r.compacted().to_vec(), compacted);

        // Exactly one helper wins retirement.
        assert!(r.claim_retire());
        assert!(!r.claim_retire());

        for &p in &compacted {
            // SAFETY: compacted chunks were published by this test and
            // never linked anywhere.
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}
