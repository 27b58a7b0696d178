//! # KiWi
//!
//! A lock-free, in-memory, ordered key-value store.
//!
//! KiWi keeps items in fixed-capacity, array-backed *chunks*, each covering a
//! contiguous key range and carrying a lock-free sorted linked list over its
//! slots. A concurrent skip list maps minimum keys to chunks for navigation,
//! and a global version counter orders all updates.
//!
//! | Feature | Status |
//! |---------|--------|
//! | Concurrent get | Works (lock-free, version-resolved) |
//! | Concurrent put / remove | Works (CAS linking + wait-free helping) |
//! | Snapshot range scans | Works (published scan versions) |
//! | Rebalancing / compaction | Works (cooperative, helper-friendly) |
//! | Persistence | Not a goal |
//!
//! ## Semantics
//!
//! - [`KiWi::put`] always overwrites; passing `None` as the value records a
//!   tombstone (logical deletion).
//! - [`KiWi::get`] is linearizable with respect to puts.
//! - [`KiWi::scan`] observes the live key-value pairs as of a single version:
//!   a concurrent put is either entirely included or entirely excluded.
//!
//! ## Thread Safety
//!
//! `KiWi<K, V>` is `Send + Sync`. Each store supports up to
//! [`Config::max_workers`] concurrently operating threads; threads claim a
//! stable worker slot on first use and release it on exit.
//!
//! ```rust
//! use kiwi::{Config, KiWi};
//!
//! let store: KiWi<u64, u64> = KiWi::new(Config::default());
//!
//! store.put(17, Some(42));
//! assert_eq!(store.get(17), Some(42));
//!
//! store.put(17, None); // tombstone
//! assert_eq!(store.get(17), None);
//! ```
//!
//! ## Memory Reclamation
//!
//! Chunks superseded by compaction stay linked for readers already walking
//! the chain and are retired through `seize`; they are freed once no thread
//! can still observe them.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// We rely on benchmark-verified #[inline(always)] placement in hot paths.
#![allow(clippy::inline_always)]

pub mod chunk;
pub mod compact;
pub mod config;
pub mod index;
pub mod iter;
pub mod key;
pub mod link;
pub mod map;
pub mod once_ref;
pub mod ordering;
pub mod rebalance;
pub mod scan;
pub mod store;
pub mod worker;

mod tracing_helpers;

// Re-export main types for convenience
pub use config::Config;
pub use key::Key;
pub use map::KiWiMap;
pub use store::KiWi;
