//! Standard memory orderings for concurrent chunk access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading chunk fields during traversal.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing chunk fields.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (compare-and-swap).
/// Used for list linking, successor splicing, version tagging.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for relaxed loads (single-writer regions, counters).
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for the descriptor-publication handshake.
///
/// A writer publishes its descriptor and then reads the version counter; a
/// helper bumps the counter and then reads the descriptor tables. That is a
/// store-load pattern: acquire/release alone would allow both sides to miss
/// each other, so descriptor stores, descriptor loads, and version-counter
/// operations all use sequential consistency.
pub const PROTOCOL: Ordering = Ordering::SeqCst;
