//! Stable worker-slot assignment.
//!
//! The helping protocol requires every thread operating on a store to own a
//! small integer slot in `0..max_workers`, stable for the thread's lifetime,
//! indexing the published put- and scan-descriptor tables. Thread ids are
//! neither dense nor bounded, so slots are claimed through a registration
//! table: a thread claims the first free slot on its first operation against
//! a store, caches it thread-locally, and releases it when the thread exits.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED, WRITE_ORD};

/// Distinguishes worker sets of different store instances in the
/// thread-local cache, including a store allocated at a reused address.
static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

/// Per-store registration table of worker slots.
#[derive(Debug)]
pub struct WorkerSet {
    id: u64,
    claimed: Box<[AtomicBool]>,
}

impl WorkerSet {
    /// Create a table with `max_workers` slots.
    #[must_use]
    pub fn new(max_workers: usize) -> Arc<Self> {
        let claimed = (0..max_workers).map(|_| AtomicBool::new(false)).collect();

        Arc::new(Self {
            id: NEXT_SET_ID.fetch_add(1, RELAXED),
            claimed,
        })
    }

    /// Number of slots in the table.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    /// Whether the table has zero slots. Always false for a validated config.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }

    /// The calling thread's slot in this set, claiming one on first use.
    ///
    /// # Panics
    ///
    /// Panics when more threads than `max_workers` operate on the store
    /// concurrently; that is a configuration error, not a runtime condition.
    pub fn current_slot(self: &Arc<Self>) -> usize {
        CLAIMS.with(|claims| {
            let mut claims = claims.borrow_mut();

            if let Some(claim) = claims.0.iter().find(|c| c.set_id == self.id) {
                return claim.slot;
            }

            let slot = self.claim_free_slot();
            claims.0.push(ThreadClaim {
                set_id: self.id,
                set: Arc::downgrade(self),
                slot,
            });
            slot
        })
    }

    fn claim_free_slot(&self) -> usize {
        for (slot, flag) in self.claimed.iter().enumerate() {
            if flag
                .compare_exchange(false, true, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                return slot;
            }
        }

        panic!(
            "worker slots exhausted: more than {} threads operate on this store concurrently",
            self.claimed.len()
        );
    }

    fn release(&self, slot: usize) {
        self.claimed[slot].store(false, WRITE_ORD);
    }
}

struct ThreadClaim {
    set_id: u64,
    set: Weak<WorkerSet>,
    slot: usize,
}

/// Releases all of a thread's claims when the thread exits.
struct ThreadClaims(Vec<ThreadClaim>);

impl Drop for ThreadClaims {
    fn drop(&mut self) {
        for claim in &self.0 {
            if let Some(set) = claim.set.upgrade() {
                set.release(claim.slot);
            }
        }
    }
}

thread_local! {
    static CLAIMS: RefCell<ThreadClaims> = const { RefCell::new(ThreadClaims(Vec::new())) };
}
