//! First-writer-wins single-assignment cell.
//!
//! [`SetOnce`] holds a heap value that is published at most once via CAS.
//! Racing writers all converge on the first published value; losers keep
//! ownership of their rejected value. Used by the rebalancer for the
//! engaged and compacted chunk lists, which are computed speculatively by
//! several helpers but must be agreed on exactly once.

use std::ptr;
use std::sync::atomic::AtomicPtr;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD};

/// A cell that can be set exactly once, lock-free.
///
/// Unlike `std::sync::OnceLock` this never blocks: publication is a single
/// CAS, and a losing writer gets its value handed back instead of waiting.
#[derive(Debug)]
pub struct SetOnce<T> {
    slot: AtomicPtr<T>,
}

impl<T> SetOnce<T> {
    /// Create an empty cell.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Try to publish `value`. Returns `Ok(())` if this call won the race,
    /// or `Err(value)` handing the rejected value back.
    pub fn set(&self, value: Box<T>) -> Result<(), Box<T>> {
        let raw = Box::into_raw(value);

        match self
            .slot
            .compare_exchange(ptr::null_mut(), raw, CAS_SUCCESS, CAS_FAILURE)
        {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: raw came from Box::into_raw above and was rejected
                // by the CAS, so we still exclusively own it.
                Err(unsafe { Box::from_raw(raw) })
            }
        }
    }

    /// Get the published value, if any.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        let p = self.slot.load(READ_ORD);
        // SAFETY: a non-null pointer was published by `set` and is never
        // replaced or freed until the cell drops.
        unsafe { p.as_ref() }
    }

    /// Whether a value has been published.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.slot.load(READ_ORD).is_null()
    }
}

impl<T> Default for SetOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SetOnce<T> {
    fn drop(&mut self) {
        let p = *self.slot.get_mut();
        if !p.is_null() {
            // SAFETY: the cell exclusively owns the published value.
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}
