//! Scan descriptors and the compaction-side scan index.
//!
//! A scan publishes a [`ScanData`] descriptor before taking its version so
//! that concurrent compactions retain every version the scan may still need.
//! During a rebalance, the active descriptors intersecting the engaged key
//! range are snapshotted into a [`ScanIndex`], which answers the per-key
//! question "which historical versions must survive pruning".

use std::sync::atomic::AtomicI32;

use crate::chunk::UNSET;
use crate::key::Key;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD};

/// A published in-flight scan: its key range and its (eventually assigned)
/// version.
///
/// The version starts [`UNSET`]; the owner CASes in the value it fetched
/// from the global counter, but a helper may win that CAS first. Both sides
/// honor whatever value sticks.
#[derive(Debug)]
pub struct ScanData<K> {
    /// Inclusive lower bound of the scanned range.
    pub min: K,
    /// Inclusive upper bound of the scanned range.
    pub max: K,
    /// Version this scan reads at; [`UNSET`] until assigned.
    pub version: AtomicI32,
}

impl<K: Key> ScanData<K> {
    /// Create a descriptor with an unassigned version.
    #[must_use]
    pub fn new(min: K, max: K) -> Self {
        Self {
            min,
            max,
            version: AtomicI32::new(UNSET),
        }
    }

    /// Try to assign `version`; returns whatever version is successfully
    /// set, by this caller or by a helper.
    pub fn assign_version(&self, version: i32) -> i32 {
        match self
            .version
            .compare_exchange(UNSET, version, CAS_SUCCESS, CAS_FAILURE)
        {
            Ok(_) => version,
            Err(current) => current,
        }
    }

    /// The assigned version, or [`UNSET`].
    #[inline]
    #[must_use]
    pub fn version(&self) -> i32 {
        self.version.load(READ_ORD)
    }
}

/// One active scan relevant to an engaged range.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScanEntry<K> {
    version: i32,
    from: K,
    to: K,
}

/// Read-only snapshot of the active scans intersecting a compaction's key
/// range, sorted by version descending.
///
/// Consulted by `Chunk::copy_part` while walking a key's versions
/// newest-first: [`ScanIndex::should_keep`] decides whether the version at
/// hand is still observable by some scan, and [`ScanIndex::saved_version`]
/// records that a version was materialized, consuming one scan slot.
#[derive(Debug)]
pub struct ScanIndex<K> {
    entries: Vec<ScanEntry<K>>,
    index: usize,
    is_first: bool,
    curr_key: Option<K>,
}

impl<K: Key> ScanIndex<K> {
    /// Build the snapshot from published scans.
    ///
    /// `range_min`/`range_max` bound the engaged chunks' key space; scans
    /// entirely outside it are dropped. `range_max` is `None` when the
    /// engaged range extends to the end of the key space.
    #[must_use]
    pub fn new(mut scans: Vec<(i32, K, K)>, range_min: K, range_max: Option<K>) -> Self {
        scans.sort_by(|a, b| b.0.cmp(&a.0));

        let entries = scans
            .into_iter()
            .filter(|&(_, min, max)| {
                max >= range_min && range_max.is_none_or(|range_max| min <= range_max)
            })
            .map(|(version, from, to)| ScanEntry { version, from, to })
            .collect();

        Self {
            entries,
            index: 0,
            is_first: true,
            curr_key: None,
        }
    }

    /// An index that keeps nothing beyond the newest version of each key.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            index: 0,
            is_first: true,
            curr_key: None,
        }
    }

    /// Start deciding versions for a new key.
    pub fn reset(&mut self, key: K) {
        self.index = 0;
        self.is_first = true;
        self.curr_key = Some(key);
    }

    /// Whether the version at hand (walked newest-first) must survive.
    ///
    /// The first version offered for a key is always kept; older versions
    /// are kept only while some unconsumed scan whose range covers the key
    /// could still observe them.
    #[must_use]
    pub fn should_keep(&self, version: i32) -> bool {
        debug_assert!(version > UNSET, "version must be real");

        if self.is_first {
            return true;
        }
        let Some(entry) = self.entries.get(self.index) else {
            return false;
        };
        let Some(key) = self.curr_key else {
            return false;
        };

        if entry.from > key || entry.to < key {
            return false;
        }

        entry.version >= version
    }

    /// Record that a version was materialized, consuming one scan slot.
    pub fn saved_version(&mut self, _version: i32) {
        if self.is_first {
            self.is_first = false;
        } else {
            self.index += 1;
        }
    }
}
