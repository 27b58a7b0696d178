//! Fixed-capacity chunk: the array-backed node of the store.
//!
//! A chunk owns two pre-sized tables. The *order table* holds fixed-width
//! item records (`next` link, version, key, signed data index) forming a
//! lock-free singly-linked list sorted by key ascending, equal keys ordered
//! newest-version-first. The *data table* holds the value slots. No per-item
//! heap allocation happens after chunk construction; all linkage is by
//! integer index, and every cross-thread field is mutated only through CAS
//! or fetch-and-add.
//!
//! # Item Life Cycle
//!
//! ```text
//! allocate          set_version            add_to_list
//!  UNSET ──────────► -v (tentative) ──────► +v (linked)
//!    │
//!    └── freeze() CAS ──► FROZEN (excluded from this chunk forever)
//! ```
//!
//! A tombstone allocated into a chunk that holds no live version of its key
//! may instead mark its `next` as canceled and never link.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::mem::MaybeUninit;
use std::ops::Bound;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::key::Key;
use crate::link::{is_marked, mark_ptr, unmark_ptr};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, PROTOCOL, READ_ORD, RELAXED, WRITE_ORD};
use crate::rebalance::Rebalancer;
use crate::scan::ScanIndex;
use crate::tracing_helpers::trace_log;

/// "No index" / head sentinel for order-table links. Must be 0: records are
/// zero-initialized and zero must mean "unset".
pub const NONE: u32 = 0;

/// "No version" sentinel. Never a real version.
pub const UNSET: i32 = 0;

/// Version sentinel meaning the slot belongs to a chunk being compacted and
/// must not be linked.
pub const FROZEN_VERSION: i32 = 1;

/// The first version the global counter hands out.
pub const FIRST_VERSION: i32 = 2;

/// `next` sentinel for an allocated-but-abandoned tombstone slot.
const CANCELED_NEXT: u32 = u32::MAX;

/// Order-table index of the list head (a bare `next` link).
const HEAD: u32 = 0;

/// One order-table record.
///
/// `key` is written exactly once by the allocating thread before the record
/// becomes reachable (via linking or a published descriptor); after that it
/// is read-only.
struct ItemRecord<K> {
    next: AtomicU32,
    version: AtomicI32,
    data: AtomicI32,
    key: UnsafeCell<MaybeUninit<K>>,
}

impl<K> ItemRecord<K> {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(NONE),
            version: AtomicI32::new(UNSET),
            data: AtomicI32::new(0),
            key: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// A fixed-capacity node of the chunk chain.
///
/// Created either as the sole head chunk at store construction or by a
/// rebalancer during compaction (as an *infant* with a live `creator`
/// back-reference). Published into the navigation index once compaction
/// completes; retired once superseded.
pub struct Chunk<K, V> {
    min_key: K,
    capacity: u32,
    allow_dups: bool,

    order: Box<[ItemRecord<K>]>,
    data: Box<[UnsafeCell<Option<V>>]>,

    /// Next free order record. Starts at 1 (record 0 is the head).
    order_count: AtomicU32,
    /// Next free data slot. Starts at 1 (slot 0 is never used so a data
    /// index is never ambiguous with its negation).
    data_count: AtomicU32,

    /// Single-writer cursors used only by compaction copy.
    order_serial: AtomicU32,
    data_serial: AtomicU32,

    /// Length of the order-table prefix known to be key-sorted.
    sorted_count: AtomicU32,

    /// Approximate number of same-key version duplicates linked.
    dups: AtomicU32,

    /// Successor in the chunk chain; LSB mark means "frozen, successor is
    /// final".
    next: AtomicPtr<Chunk<K, V>>,

    /// The rebalancer owning this chunk's compaction, if engaged. Holds one
    /// strong `Arc` count, released on chunk drop.
    rebalancer: AtomicPtr<Rebalancer<K, V>>,

    /// Back-reference to the chunk that spawned this one; non-null marks
    /// this chunk as an infant that cannot take direct writes yet.
    creator: AtomicPtr<Chunk<K, V>>,

    /// Pending-put descriptors, one per worker slot: the order index of an
    /// allocation that has been published but not yet linked.
    put_slots: Box<[CachePadded<AtomicU32>]>,

    /// Serializes insert-if-absent publication of this chunk into the
    /// navigation index.
    publish_lock: Mutex<()>,
}

// SAFETY: all shared mutation goes through atomics; the UnsafeCell fields
// follow a publish-once protocol (written before the owning record/slot is
// reachable, read-only afterwards).
unsafe impl<K: Key, V: Send> Send for Chunk<K, V> {}
// SAFETY: see above.
unsafe impl<K: Key, V: Send + Sync> Sync for Chunk<K, V> {}

/// Outcome of an allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// One of the chunk's tables is exhausted; the caller must rebalance
    /// and retry. Never surfaced to users.
    Full,
}

impl<K: Key, V> Chunk<K, V> {
    /// Current successor, mark stripped. Null at the chain tail.
    ///
    /// Available for any `V` (no `Clone` bound) so chain teardown in `Drop`
    /// can walk the live chain.
    #[inline]
    pub(crate) fn next_unmarked(&self) -> *mut Self {
        unmark_ptr(self.next.load(READ_ORD))
    }
}

impl<K: Key, V: Clone> Chunk<K, V> {
    /// Create a chunk covering keys `>= min_key`.
    pub(crate) fn new(
        min_key: K,
        capacity: usize,
        max_workers: usize,
        allow_dups: bool,
        creator: *mut Self,
    ) -> Box<Self> {
        let records = capacity + 1;
        let order: Box<[ItemRecord<K>]> = (0..records).map(|_| ItemRecord::new()).collect();
        let data: Box<[UnsafeCell<Option<V>>]> =
            (0..records).map(|_| UnsafeCell::new(None)).collect();
        let put_slots: Box<[CachePadded<AtomicU32>]> = (0..max_workers)
            .map(|_| CachePadded::new(AtomicU32::new(NONE)))
            .collect();

        Box::new(Self {
            min_key,
            capacity: u32::try_from(capacity).expect("chunk capacity exceeds u32"),
            allow_dups,
            order,
            data,
            order_count: AtomicU32::new(1),
            data_count: AtomicU32::new(1),
            order_serial: AtomicU32::new(1),
            data_serial: AtomicU32::new(1),
            sorted_count: AtomicU32::new(0),
            dups: AtomicU32::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            rebalancer: AtomicPtr::new(ptr::null_mut()),
            creator: AtomicPtr::new(creator),
            put_slots,
            publish_lock: Mutex::new(()),
        })
    }

    /// A fresh chunk with the same layout, spawned during compaction.
    /// `creator` marks the new chunk as an infant of this one.
    pub(crate) fn new_child(&self, min_key: K, creator: *mut Self) -> Box<Self> {
        Self::new(
            min_key,
            self.capacity as usize,
            self.put_slots.len(),
            self.allow_dups,
            creator,
        )
    }

    // ========================================================================
    //  Plain accessors
    // ========================================================================

    /// Inclusive lower bound of keys this chunk may hold.
    #[inline]
    pub(crate) const fn min_key(&self) -> K {
        self.min_key
    }

    /// Number of order records allocated (clamped to capacity; a frozen
    /// chunk's counter sits far beyond the table).
    pub(crate) fn filled_count(&self) -> u32 {
        (self.order_count.load(RELAXED).saturating_sub(1)).min(self.capacity)
    }

    /// Approximate number of items this chunk would hold after compaction.
    pub(crate) fn compacted_count(&self) -> u32 {
        self.filled_count()
            .saturating_sub(self.dups.load(RELAXED))
    }

    #[inline]
    pub(crate) fn sorted_count(&self) -> u32 {
        self.sorted_count.load(READ_ORD)
    }

    // ========================================================================
    //  Chain linkage (markable successor)
    // ========================================================================

    /// Whether the successor pointer is marked final.
    #[inline]
    pub(crate) fn next_is_marked(&self) -> bool {
        is_marked(self.next.load(READ_ORD))
    }

    /// Plain successor store; only valid while this chunk is private to one
    /// thread (compaction pre-linking).
    pub(crate) fn set_next(&self, next: *mut Self) {
        self.next.store(next, WRITE_ORD);
    }

    /// CAS the successor from `expected` to `new`, both unmarked.
    pub(crate) fn cas_next(&self, expected: *mut Self, new: *mut Self) -> bool {
        self.next
            .compare_exchange(expected, new, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Mark the successor pointer final, so it can never change again.
    ///
    /// Returns the successor that is now frozen in place. Loops because
    /// other splice operations may still be swinging the pointer.
    pub(crate) fn mark_and_get_next(&self) -> *mut Self {
        loop {
            let curr = self.next.load(READ_ORD);
            if is_marked(curr) {
                return unmark_ptr(curr);
            }
            if self
                .next
                .compare_exchange(curr, mark_ptr(curr), CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                return curr;
            }
        }
    }

    // ========================================================================
    //  Infant / rebalancer back-references
    // ========================================================================

    /// The chunk that spawned this one, while the spawn is still in
    /// progress. Non-null means "infant": route writes to the parent.
    #[inline]
    pub(crate) fn creator(&self) -> *mut Self {
        self.creator.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn is_infant(&self) -> bool {
        !self.creator().is_null()
    }

    /// Clear the infant marker. Ordered after the chunk became reachable
    /// through the index/chain (Release pairs with readers' Acquire).
    pub(crate) fn clear_creator(&self) {
        self.creator.store(ptr::null_mut(), WRITE_ORD);
    }

    /// Try to engage this chunk to rebalancer `r`; at most one rebalancer
    /// ever owns a chunk. The stored pointer carries one strong count.
    pub(crate) fn engage(&self, r: &Arc<Rebalancer<K, V>>) {
        let raw = Arc::into_raw(Arc::clone(r)).cast_mut();
        if self
            .rebalancer
            .compare_exchange(ptr::null_mut(), raw, CAS_SUCCESS, CAS_FAILURE)
            .is_err()
        {
            // Lost the race; hand the count back.
            // SAFETY: raw came from Arc::into_raw above and was rejected.
            unsafe { drop(Arc::from_raw(raw)) };
        }
    }

    /// Whether this chunk is engaged to `r` (`None` = engaged to nobody).
    pub(crate) fn is_engaged(&self, r: Option<&Rebalancer<K, V>>) -> bool {
        let current = self.rebalancer.load(READ_ORD);
        match r {
            None => current.is_null(),
            Some(r) => ptr::eq(current, ptr::from_ref(r).cast_mut()),
        }
    }

    /// Borrow the owning rebalancer, if engaged. The reference is valid for
    /// the chunk's lifetime: the chunk holds a strong count until it drops.
    pub(crate) fn rebalancer(&self) -> Option<&Rebalancer<K, V>> {
        let p = self.rebalancer.load(READ_ORD);
        // SAFETY: non-null pointers were published via Arc::into_raw and the
        // chunk keeps the count alive until drop.
        unsafe { p.as_ref() }
    }

    /// Clone out the owning rebalancer.
    pub(crate) fn rebalancer_arc(&self) -> Option<Arc<Rebalancer<K, V>>> {
        let p = self.rebalancer.load(READ_ORD);
        if p.is_null() {
            return None;
        }
        // SAFETY: the chunk's own strong count keeps the Arc alive while we
        // take another.
        unsafe {
            Arc::increment_strong_count(p);
            Some(Arc::from_raw(p))
        }
    }

    /// Whether this chunk's range has already been replaced by compacted
    /// chunks.
    pub(crate) fn is_rebalanced(&self) -> bool {
        self.rebalancer().is_some_and(Rebalancer::is_compacted)
    }

    // ========================================================================
    //  Record field access
    // ========================================================================

    #[inline]
    fn record(&self, oi: u32) -> &ItemRecord<K> {
        &self.order[oi as usize]
    }

    /// List successor of `oi` (which may be [`HEAD`]).
    #[inline]
    pub(crate) fn next_of(&self, oi: u32) -> u32 {
        self.record(oi).next.load(READ_ORD)
    }

    /// First item reachable from the list head.
    #[inline]
    pub(crate) fn first_item(&self) -> u32 {
        self.next_of(HEAD)
    }

    /// The key written into record `oi`.
    #[inline]
    pub(crate) fn key_at(&self, oi: u32) -> K {
        debug_assert_ne!(oi, NONE, "head has no key");
        // SAFETY: keys are written before a record becomes reachable and
        // never change afterwards; K is Copy.
        unsafe { (*self.record(oi).key.get()).assume_init() }
    }

    /// Signed data index of record `oi` (negative = tombstone).
    #[inline]
    pub(crate) fn raw_data(&self, oi: u32) -> i32 {
        self.record(oi).data.load(READ_ORD)
    }

    /// Raw version field: negative = tentative, positive = linked.
    #[inline]
    fn raw_version(&self, oi: u32) -> i32 {
        self.record(oi).version.load(READ_ORD)
    }

    /// Current version magnitude of record `oi` ([`UNSET`] if untagged).
    #[inline]
    pub(crate) fn version_of(&self, oi: u32) -> i32 {
        self.raw_version(oi).abs()
    }

    /// The value of record `oi`, or `None` for a tombstone.
    pub(crate) fn get_data(&self, oi: u32) -> Option<V> {
        let di = self.raw_data(oi);
        if di < 0 {
            return None;
        }
        // SAFETY: a positive data index was published after its slot was
        // written; slots are never rewritten once reachable.
        unsafe { (*self.data[di as usize].get()).clone() }
    }

    /// Tag record `oi` with `version` unless a concurrent tagger or freeze
    /// got there first; returns whatever version magnitude is in effect.
    pub(crate) fn set_version(&self, oi: u32, version: i32) -> i32 {
        debug_assert!(version >= FIRST_VERSION);
        // Negative encodes "tentatively set, not yet linked".
        match self.record(oi).version.compare_exchange(
            UNSET,
            -version,
            CAS_SUCCESS,
            CAS_FAILURE,
        ) {
            Ok(_) => version,
            Err(_) => self.version_of(oi),
        }
    }

    /// Flip the version field positive once the record is linked.
    fn mark_linked(&self, oi: u32) {
        let v = self.version_of(oi);
        self.record(oi).version.store(v, WRITE_ORD);
    }

    // ========================================================================
    //  Allocation
    // ========================================================================

    /// Reserve one order record and one data slot, writing key and value
    /// eagerly. Returns [`AllocError::Full`] if either table is exhausted.
    ///
    /// Concurrent allocations never collide: both counters are independent
    /// fetch-and-adds and every index is handed out once.
    pub(crate) fn allocate(&self, key: K, value: Option<&V>) -> Result<u32, AllocError> {
        let oi = self.order_count.fetch_add(1, CAS_SUCCESS);
        if oi > self.capacity {
            return Err(AllocError::Full);
        }

        let di = self.data_count.fetch_add(1, CAS_SUCCESS);
        if di > self.capacity {
            return Err(AllocError::Full);
        }

        // SAFETY: we exclusively own record `oi` and slot `di` until this
        // item is published (linked or advertised through a descriptor).
        unsafe {
            (*self.record(oi).key.get()).write(key);
            if let Some(v) = value {
                *self.data[di as usize].get() = Some(v.clone());
            }
        }

        let signed_di = if value.is_some() {
            i32::try_from(di).expect("data index exceeds i32")
        } else {
            -i32::try_from(di).expect("data index exceeds i32")
        };
        self.record(oi).data.store(signed_di, WRITE_ORD);

        Ok(oi)
    }

    /// Whether allocation has been shut off by a freeze.
    ///
    /// Sequentially consistent so a writer that published its descriptor
    /// after the freeze's table scan is guaranteed to observe the freeze
    /// here (the counter bump precedes the scan on the freezing side).
    #[inline]
    pub(crate) fn is_frozen(&self) -> bool {
        self.order_count.load(PROTOCOL) > self.capacity
    }

    /// CAS record `oi` from unversioned to [`FROZEN_VERSION`], excluding it
    /// from this chunk.
    pub(crate) fn try_freeze_item(&self, oi: u32) -> bool {
        self.record(oi)
            .version
            .compare_exchange(UNSET, FROZEN_VERSION, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    // ========================================================================
    //  Pending-put descriptors
    // ========================================================================

    /// Publish (or with [`NONE`], clear) the calling worker's pending put.
    ///
    /// Publication happens *before* version tagging so helpers can always
    /// either see the version or assign one; the sequentially consistent
    /// store pairs with helpers' counter bumps.
    pub(crate) fn publish_put(&self, worker: usize, oi: u32) {
        self.put_slots[worker].store(oi, PROTOCOL);
    }

    /// this method is used by get operations (ONLY) to help pending put
    /// operations set a version.
    ///
    /// Returns the newest pending put matching `key`, or `None` when there
    /// is none or the chunk has already been superseded.
    pub(crate) fn help_put_in_get(&self, my_version: i32, key: K) -> Option<u32> {
        let mut newest: Option<u32> = None;
        let mut newest_ver = UNSET;

        for slot in &self.put_slots {
            let oi = slot.load(PROTOCOL);
            if oi == NONE {
                continue;
            }
            if self.key_at(oi) != key {
                continue;
            }

            let mut ver = self.version_of(oi);
            if ver == UNSET {
                // Pending and unversioned: tag it with the current version
                // so it cannot later appear with an older one.
                ver = self.set_version(oi, my_version);
            }
            if ver == FROZEN_VERSION {
                continue;
            }

            let replace = match newest {
                None => true,
                // Higher version wins; same version resolves by allocation
                // order (later allocation implies the writer observed this
                // chunk after its current state).
                Some(best) => ver > newest_ver || (ver == newest_ver && oi > best),
            };
            if replace {
                newest = Some(oi);
                newest_ver = ver;
            }
        }

        if self.is_rebalanced() { None } else { newest }
    }

    /// this method is used by scan operations (ONLY) to help pending put
    /// operations set a version.
    ///
    /// Returns, per key in `[min, max]`, the newest pending put visible at
    /// `my_version`.
    pub(crate) fn help_put_in_scan(&self, my_version: i32, min: K, max: K) -> BTreeMap<K, u32> {
        let mut items: BTreeMap<K, u32> = BTreeMap::new();

        for slot in &self.put_slots {
            let oi = slot.load(PROTOCOL);
            if oi == NONE {
                continue;
            }

            let key = self.key_at(oi);
            if key < min || key > max {
                continue;
            }

            let mut ver = self.version_of(oi);
            if ver == UNSET {
                ver = self.set_version(oi, my_version);
            }
            // Frozen or beyond this scan's snapshot: invisible.
            if ver == FROZEN_VERSION || ver > my_version {
                continue;
            }

            match items.get(&key) {
                Some(&prev) => {
                    let prev_ver = self.version_of(prev);
                    if prev_ver > ver || (prev_ver == ver && prev > oi) {
                        continue;
                    }
                    items.insert(key, oi);
                }
                None => {
                    items.insert(key, oi);
                }
            }
        }

        items
    }

    // ========================================================================
    //  Freeze
    // ========================================================================

    /// Freeze the chunk so no more changes can be done in it.
    ///
    /// Shuts off allocation by pushing the order counter past the table,
    /// then settles every published pending put: unversioned ones are
    /// frozen out (their writers will retry elsewhere), versioned ones are
    /// linked on the writer's behalf so the frozen chunk is fully
    /// consistent before compaction reads it.
    pub(crate) fn freeze(&self) {
        self.order_count.fetch_add(self.capacity + 1, PROTOCOL);

        for slot in &self.put_slots {
            let oi = slot.load(PROTOCOL);
            if oi == NONE {
                continue;
            }

            let ver = self.version_of(oi);
            if ver == FROZEN_VERSION {
                continue;
            }
            if ver == UNSET
                && (self.try_freeze_item(oi) || self.version_of(oi) == FROZEN_VERSION)
            {
                continue;
            }

            // The item carries a real version - finish its linking so the
            // frozen state is complete.
            self.add_to_list(oi, self.key_at(oi));
        }
    }

    // ========================================================================
    //  Sorted-list insertion
    // ========================================================================

    /// binary search for the largest sorted entry with key smaller than
    /// `key`; returns the record to start a linear scan from (the head when
    /// the sorted prefix does not help).
    fn binary_find(&self, key: K) -> u32 {
        let sorted = self.sorted_count();
        if sorted == 0 || self.key_at(1) >= key {
            return HEAD;
        }

        // Sorted records occupy indices 1..=sorted.
        let mut start = 0_u32;
        let mut end = sorted;
        while end - start > 1 {
            let mid = start + (end - start) / 2;
            if self.key_at(mid + 1) >= key {
                end = mid;
            } else {
                start = mid;
            }
        }

        start + 1
    }

    /// Insert the already-versioned record `oi` into the chunk's sorted
    /// linked list.
    ///
    /// Lock-free: nothing is ever removed from the list, so a failed CAS
    /// restarts from the binary-search anchor without retreating. Completes
    /// when the record's version flips positive - possibly flipped by a
    /// helper that linked it for us.
    pub(crate) fn add_to_list(&self, oi: u32, key: K) {
        let mut anchor: Option<u32> = None;

        // Retry while the version is still negative (tentative, unlinked).
        while self.raw_version(oi) < 0 {
            let saved_next = self.next_of(oi);

            let start = *anchor.get_or_insert_with(|| self.binary_find(key));
            let mut prev = start;
            let mut curr;
            let mut found_equal = false;

            loop {
                curr = self.next_of(prev);
                if curr == NONE {
                    break;
                }
                // Already inserted by a helper.
                if curr == oi {
                    return;
                }

                let curr_key = self.key_at(curr);
                if curr_key > key {
                    break;
                }
                if curr_key == key {
                    found_equal = true;

                    if !self.allow_dups {
                        return;
                    }

                    let ver_mine = self.version_of(oi);
                    let ver_curr = self.version_of(curr);

                    // Larger versions come first: insert before `curr`.
                    if ver_curr < ver_mine {
                        break;
                    }

                    if ver_curr == ver_mine {
                        // Equal version race: the later-allocated slot wins
                        // by retargeting the linked record's data pointer,
                        // so a single node represents the winner.
                        let new_di = self.raw_data(oi);
                        let mut old_di = self.raw_data(curr);
                        while new_di.abs() > old_di.abs() {
                            match self.record(curr).data.compare_exchange(
                                old_di,
                                new_di,
                                CAS_SUCCESS,
                                CAS_FAILURE,
                            ) {
                                Ok(_) => break,
                                Err(actual) => old_di = actual,
                            }
                        }
                        return;
                    }
                    // ver_curr > ver_mine: keep walking past newer versions.
                }

                prev = curr;
            }

            if saved_next == CANCELED_NEXT {
                return;
            }

            // A tombstone for a key this chunk has no version of is a no-op:
            // mark the slot canceled instead of linking it.
            if !found_equal && saved_next == NONE && self.raw_data(oi) < 0 {
                if self
                    .record(oi)
                    .next
                    .compare_exchange(NONE, CANCELED_NEXT, CAS_SUCCESS, CAS_FAILURE)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            // Double CAS: first our own next (from its last published value,
            // since a helper may race us), then the predecessor's.
            if self
                .record(oi)
                .next
                .compare_exchange(saved_next, curr, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
                && self
                    .record(prev)
                    .next
                    .compare_exchange(curr, oi, CAS_SUCCESS, CAS_FAILURE)
                    .is_ok()
            {
                self.mark_linked(oi);
                if found_equal {
                    self.dups.fetch_add(1, RELAXED);
                }
                return;
            }
        }
    }

    // ========================================================================
    //  Lookup
    // ========================================================================

    /// Find the value for `key`, resolving against a pending put discovered
    /// through the helping protocol. Returns `None` for both "absent" and
    /// "tombstoned".
    pub(crate) fn find(&self, key: K, helped: Option<u32>) -> Option<V> {
        let mut curr = self.next_of(self.binary_find(key));

        while curr != NONE {
            let curr_key = self.key_at(curr);
            if curr_key > key {
                break;
            }
            if curr_key == key {
                return self.choose_newer(curr, helped);
            }
            curr = self.next_of(curr);
        }

        // No linked item: the pending put (already versioned by the helping
        // pass) is the only candidate.
        helped.and_then(|h| self.get_data(h))
    }

    /// Resolve a linked item against a pending descriptor: higher version
    /// wins, equal versions go to the later-allocated slot.
    fn choose_newer(&self, item: u32, helped: Option<u32>) -> Option<V> {
        let Some(pd) = helped else {
            return self.get_data(item);
        };

        let item_ver = self.version_of(item);
        let pd_ver = self.version_of(pd);

        if item_ver > pd_ver {
            self.get_data(item)
        } else if pd_ver > item_ver {
            self.get_data(pd)
        } else {
            self.get_data(item.max(pd))
        }
    }

    /// First item with key `>= min` and version `<= version`, or [`NONE`].
    pub(crate) fn find_first(&self, min: K, version: i32) -> u32 {
        let mut curr = self.next_of(self.binary_find(min));

        while curr != NONE {
            if self.key_at(curr) >= min && self.version_of(curr) <= version {
                return curr;
            }
            curr = self.next_of(curr);
        }

        NONE
    }

    /// First item after `curr` with a key different from `key` and a
    /// version `<= version`, or [`NONE`].
    pub(crate) fn find_next(&self, mut curr: u32, version: i32, key: K) -> u32 {
        curr = self.next_of(curr);

        while curr != NONE {
            if self.key_at(curr) != key && self.version_of(curr) <= version {
                return curr;
            }
            curr = self.next_of(curr);
        }

        NONE
    }

    // ========================================================================
    //  Scan range copy
    // ========================================================================

    /// Copy the live values in `[min, max]` visible at `my_version` into
    /// `out`, merging the linked list with the helped pending-put map.
    /// Returns the number of values written; stops early when `out` fills.
    pub(crate) fn copy_values_into(
        &self,
        out: &mut [V],
        my_version: i32,
        min: K,
        max: K,
        helped: &BTreeMap<K, u32>,
    ) -> usize {
        let mut written = 0_usize;
        let mut helped_iter = helped
            .range((Bound::Included(min), Bound::Included(max)))
            .peekable();
        let mut oi = self.find_first(min, my_version);

        while written < out.len() {
            let list_key = (oi != NONE)
                .then(|| self.key_at(oi))
                .filter(|&k| k <= max);
            let pend_key = helped_iter.peek().map(|&(&k, _)| k);

            let value = match (list_key, pend_key) {
                (None, None) => break,
                (Some(lk), None) => {
                    let v = self.get_data(oi);
                    oi = self.find_next(oi, my_version, lk);
                    v
                }
                (None, Some(_)) => {
                    let (_, &h_oi) = helped_iter.next().expect("peeked");
                    self.get_data(h_oi)
                }
                (Some(lk), Some(pk)) => {
                    if lk < pk {
                        let v = self.get_data(oi);
                        oi = self.find_next(oi, my_version, lk);
                        v
                    } else if pk < lk {
                        let (_, &h_oi) = helped_iter.next().expect("peeked");
                        self.get_data(h_oi)
                    } else {
                        // Same key in both: resolve by (version, slot order).
                        let (_, &h_oi) = helped_iter.next().expect("peeked");
                        let v = self.choose_newer(oi, Some(h_oi));
                        oi = self.find_next(oi, my_version, lk);
                        v
                    }
                }
            };

            // Tombstones consume their key but emit nothing.
            if let Some(v) = value {
                out[written] = v;
                written += 1;
            }
        }

        written
    }

    // ========================================================================
    //  Compaction copy (single-writer)
    // ========================================================================

    /// Append a new item to the end of the serial region. Assumes the
    /// region is sorted ascending by (key, -version). Not thread safe:
    /// only for chunks accessible by a single thread.
    pub(crate) fn append_item(&self, key: K, value: Option<V>, version: i32) {
        let oi = self.order_serial.load(RELAXED);
        let di = self.data_serial.load(RELAXED);
        debug_assert!(oi <= self.capacity, "serial append past chunk capacity");

        // SAFETY: single-writer region; nothing else touches serial slots.
        unsafe {
            (*self.record(oi).key.get()).write(key);
        }

        let signed_di = if let Some(v) = value {
            // SAFETY: single-writer region.
            unsafe { *self.data[di as usize].get() = Some(v) };
            i32::try_from(di).expect("data index exceeds i32")
        } else {
            -i32::try_from(di).expect("data index exceeds i32")
        };

        self.record(oi).data.store(signed_di, WRITE_ORD);
        // Positive version marks the item as linked.
        self.record(oi).version.store(version, WRITE_ORD);
        self.record(oi - 1).next.store(oi, WRITE_ORD);

        self.order_serial.store(oi + 1, RELAXED);
        self.data_serial.store(di + 1, RELAXED);
    }

    /// Pre-link the serial tail to the upcoming slot so the list stays
    /// connected between appends.
    fn link_serial_tail(&self) {
        let serial = self.order_serial.load(RELAXED);
        self.record(serial - 1).next.store(serial, WRITE_ORD);
    }

    /// Copies items from `src` performing compaction on the fly.
    ///
    /// Runs of physically contiguous, single-version, live, ascending slots
    /// are block-copied; everything else goes one at a time through
    /// [`Self::append_item`] with per-version filtering against
    /// `scan_index`. Tombstones survive only while some active scan still
    /// needs to observe the deletion.
    ///
    /// Returns the source position to resume from, or [`NONE`] when the
    /// source is exhausted. `max_capacity` caps how many items this call
    /// may leave in `self` (modest overshoot from retained versions is
    /// allowed, which is why chunks keep headroom above the high
    /// watermark).
    #[allow(clippy::too_many_lines)]
    pub(crate) fn copy_part(
        &self,
        src: &Self,
        mut oi: u32,
        max_capacity: u32,
        scan_index: &mut ScanIndex<K>,
    ) -> u32 {
        let cap_records = max_capacity + 1;

        if self.order_serial.load(RELAXED) >= cap_records {
            return oi;
        }
        debug_assert!(oi <= src.capacity, "resume position outside source");

        self.link_serial_tail();

        let src_sorted = src.sorted_count();

        let mut run_start = oi;
        let mut run_len = 0_u32;
        let mut is_first = true;

        let mut prev_key: Option<K> = None;
        let mut oi_prev = NONE;
        let mut prev_data = 0_i32;

        loop {
            if oi == NONE {
                // Empty source: nothing to copy.
                break;
            }

            let mut curr_key = src.key_at(oi);
            let mut curr_data = src.raw_data(oi);

            // Fast path: extend the contiguous run.
            let serial = self.order_serial.load(RELAXED);
            let extend = curr_data > 0
                && (is_first
                    || (oi_prev <= src_sorted
                        && prev_key != Some(curr_key)
                        && oi_prev + 1 == oi
                        && serial + run_len <= cap_records
                        && prev_data + 1 == curr_data));

            if extend {
                run_len += 1;
                is_first = false;

                prev_key = Some(curr_key);
                oi_prev = oi;
                prev_data = curr_data;
                oi = src.next_of(oi);

                if oi != NONE {
                    continue;
                }
            }

            // Flush the accumulated run as a block.
            if run_len > 0 {
                let dest_oi = self.order_serial.load(RELAXED);
                let dest_di = self.data_serial.load(RELAXED);
                let src_di = src.raw_data(run_start);
                debug_assert!(src_di > 0);

                for i in 0..run_len {
                    let d = dest_oi + i;
                    let s = run_start + i;

                    self.record(d).next.store(d + 1, WRITE_ORD);
                    self.record(d)
                        .version
                        .store(src.version_of(s), WRITE_ORD);
                    self.record(d).data.store(
                        i32::try_from(dest_di + i).expect("data index exceeds i32"),
                        WRITE_ORD,
                    );
                    // SAFETY: single-writer serial region of `self`; source
                    // records are frozen and fully published.
                    unsafe {
                        (*self.record(d).key.get()).write(src.key_at(s));
                        let v = (*src.data[(src_di as u32 + i) as usize].get()).clone();
                        *self.data[(dest_di + i) as usize].get() = v;
                    }
                }

                self.order_serial.store(dest_oi + run_len, RELAXED);
                self.data_serial.store(dest_di + run_len, RELAXED);
            }

            if oi == NONE && extend {
                // Source exhausted on the fast path.
                break;
            }

            // Slow path: the item at `oi` broke the run - multi-version key,
            // tombstone, or capacity boundary. Decide its versions one by
            // one against the active scans.
            scan_index.reset(curr_key);
            // The newest version was either just block-copied or is a
            // leading tombstone handled below.
            scan_index.saved_version(UNSET);

            let mut curr_version = src.version_of(oi);
            let mut removed_version = UNSET;

            // The case when we start from a deleted item.
            if prev_key != Some(curr_key) && curr_data < 0 {
                removed_version = curr_version;
                prev_key = Some(curr_key);

                oi = src.next_of(oi);
                if oi != NONE {
                    curr_data = src.raw_data(oi);
                    curr_version = src.version_of(oi);
                    curr_key = src.key_at(oi);
                }
            }

            // Copy versions of the current key while the scans require them.
            while oi != NONE && prev_key == Some(curr_key) {
                if scan_index.should_keep(curr_version) {
                    if curr_data < 0 {
                        removed_version = curr_version;
                        scan_index.saved_version(curr_version);
                    } else if curr_version != removed_version {
                        if removed_version != UNSET {
                            // Materialize the deletion that still masks this
                            // key for newer scans.
                            self.append_item(curr_key, None, removed_version);
                            self.link_serial_tail();
                            scan_index.saved_version(removed_version);
                            removed_version = UNSET;
                        }

                        self.append_item(curr_key, src.get_data(oi), curr_version);
                        self.link_serial_tail();
                        scan_index.saved_version(curr_version);
                    }
                }

                prev_key = Some(curr_key);

                oi = src.next_of(oi);
                if oi != NONE {
                    curr_data = src.raw_data(oi);
                    curr_version = src.version_of(oi);
                    curr_key = src.key_at(oi);
                }
            }

            if oi == NONE || self.order_serial.load(RELAXED) > cap_records {
                break;
            }

            run_start = oi;
            run_len = 0;
            is_first = true;
        }

        // Terminate the list and publish the serial counters.
        let serial = self.order_serial.load(RELAXED);
        self.record(serial - 1).next.store(NONE, WRITE_ORD);

        self.order_count.store(serial, WRITE_ORD);
        self.data_count
            .store(self.data_serial.load(RELAXED), WRITE_ORD);
        self.sorted_count.store(serial - 1, WRITE_ORD);

        trace_log!(copied = serial - 1, resume = oi, "copy_part finished");

        oi
    }

    // ========================================================================
    //  Index publication lock
    // ========================================================================

    /// Run `f` under this chunk's publication lock. Guards the
    /// insert-if-absent of a freshly compacted chunk into the navigation
    /// index against double insertion.
    pub(crate) fn with_publish_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _held = self.publish_lock.lock();
        f()
    }
}

impl<K: Key, V> std::fmt::Debug for Chunk<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("min_key", &self.min_key)
            .field("capacity", &self.capacity)
            .field("filled", &self.order_count.load(RELAXED).saturating_sub(1))
            .field("sorted_count", &self.sorted_count.load(RELAXED))
            .field("infant", &!self.creator.load(RELAXED).is_null())
            .finish_non_exhaustive()
    }
}

// Chunks are reclaimed either through seize retirement or the store's chain
// teardown; the Drop impl only releases the rebalancer reference the chunk
// holds.
impl<K, V> Drop for Chunk<K, V> {
    fn drop(&mut self) {
        let p = *self.rebalancer.get_mut();
        if !p.is_null() {
            // SAFETY: the pointer was published via Arc::into_raw with a
            // count owned by this chunk.
            unsafe { drop(Arc::from_raw(p)) };
        }
    }
}
