//! Store configuration.
//!
//! All parameters are fixed at store construction. Invalid combinations are
//! programming errors and fail fast in [`Config::validate`] rather than
//! being surfaced as runtime errors.

/// Configuration for a [`crate::KiWi`] store.
///
/// The defaults are tuned for mixed read/write workloads; tests use much
/// smaller chunks to force frequent rebalancing.
///
/// # Example
///
/// ```rust
/// use kiwi::Config;
///
/// let config = Config::default().with_chunk_capacity(256).with_max_workers(16);
/// assert_eq!(config.chunk_capacity, 256);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of item slots per chunk (order and data tables).
    pub chunk_capacity: usize,

    /// Maximum number of threads that may operate on the store concurrently.
    /// Bounds the published-descriptor tables.
    pub max_workers: usize,

    /// Whether a chunk list may hold multiple versions of the same key.
    /// When `false`, an insert that finds its key already linked aborts.
    pub allow_duplicates: bool,

    /// Whether scans are supported. Disabling drops the scan table and the
    /// put-descriptor publication step.
    pub scan_support: bool,

    /// Percentage of successful puts that consider triggering a rebalance.
    pub rebalance_prob_pct: u32,

    /// A chunk becomes a rebalance candidate once its item count exceeds
    /// `sorted_count * sorted_rebalance_ratio`.
    pub sorted_rebalance_ratio: f64,

    /// Maximum number of chunks a single rebalance may engage.
    pub rebalance_size: usize,

    /// Fraction of chunk capacity a merged chunk may fill before the
    /// engagement policy stops extending the range.
    pub max_after_merge_part: f64,

    /// Compaction fills destination chunks up to this many items before
    /// considering a split.
    pub low_watermark: usize,

    /// Hard fill cap for a destination chunk when compaction decides to
    /// append a short frozen suffix instead of splitting. Leaves headroom
    /// for per-scan retained versions.
    pub high_watermark: usize,

    /// Remaining-item bound for the look-ahead that decides whether the
    /// tail of a frozen range fits into the current destination chunk.
    pub max_append_range: usize,
}

impl Config {
    const DEFAULT_CAPACITY: usize = 2048;
    const DEFAULT_WORKERS: usize = 32;

    /// Set the per-chunk item capacity, recomputing the derived compaction
    /// watermarks.
    #[must_use]
    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.chunk_capacity = capacity;
        self.low_watermark = capacity / 2;
        self.high_watermark = capacity.saturating_sub(self.max_workers);
        self.max_append_range = capacity / 5;
        self
    }

    /// Set the maximum number of concurrent worker threads.
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self.high_watermark = self.chunk_capacity.saturating_sub(workers);
        self
    }

    /// Set the duplicate-version policy.
    #[must_use]
    pub const fn with_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    /// Enable or disable scan support.
    #[must_use]
    pub const fn with_scan_support(mut self, scans: bool) -> Self {
        self.scan_support = scans;
        self
    }

    /// Set the rebalance trigger probability, in percent.
    #[must_use]
    pub const fn with_rebalance_prob_pct(mut self, pct: u32) -> Self {
        self.rebalance_prob_pct = pct;
        self
    }

    /// Fail fast on parameter combinations that cannot work.
    ///
    /// # Panics
    ///
    /// Panics on zero capacity, zero workers, a capacity too small to leave
    /// compaction headroom, or watermarks that exceed the capacity.
    pub fn validate(&self) {
        assert!(self.chunk_capacity > 0, "chunk_capacity must be nonzero");
        assert!(self.max_workers > 0, "max_workers must be nonzero");
        assert!(
            self.chunk_capacity > self.max_workers,
            "chunk_capacity ({}) must exceed max_workers ({}) to leave compaction headroom",
            self.chunk_capacity,
            self.max_workers,
        );
        assert!(
            self.low_watermark > 0 && self.low_watermark <= self.chunk_capacity,
            "low_watermark out of range"
        );
        assert!(
            self.high_watermark >= self.low_watermark && self.high_watermark <= self.chunk_capacity,
            "high_watermark out of range"
        );
        assert!(self.rebalance_size > 0, "rebalance_size must be nonzero");
        assert!(self.rebalance_prob_pct <= 100, "rebalance_prob_pct > 100");
        assert!(
            self.max_after_merge_part > 0.0 && self.max_after_merge_part <= 1.0,
            "max_after_merge_part out of (0, 1]"
        );
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_capacity: Self::DEFAULT_CAPACITY,
            max_workers: Self::DEFAULT_WORKERS,
            allow_duplicates: true,
            scan_support: true,
            rebalance_prob_pct: 2,
            sorted_rebalance_ratio: 1.8,
            rebalance_size: 2,
            max_after_merge_part: 0.5,
            low_watermark: Self::DEFAULT_CAPACITY / 2,
            high_watermark: Self::DEFAULT_CAPACITY - Self::DEFAULT_WORKERS,
            max_append_range: Self::DEFAULT_CAPACITY / 5,
        }
    }
}
