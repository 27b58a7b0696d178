//! Compaction: merge an engaged run of frozen chunks into fresh chunks.
//!
//! The compactor streams items out of the frozen run through
//! `Chunk::copy_part`, filling destination chunks up to the low watermark.
//! At each watermark it looks ahead a bounded distance: if the remaining
//! frozen suffix is short, it is appended into the current destination
//! instead of opening a new chunk, avoiding fragmentation at the range
//! boundary. The produced chunks come back pre-linked in order, covering
//! exactly the key space of the frozen run.

use crate::chunk::{Chunk, NONE};
use crate::config::Config;
use crate::iter::MultiChunkIterator;
use crate::key::Key;
use crate::scan::ScanIndex;
use crate::tracing_helpers::debug_log;

/// Merge `frozen` (a non-empty, in-order engaged run) into new chunks,
/// pruning versions no active scan in `scan_index` can still observe.
///
/// The first produced chunk inherits the first frozen chunk's `min_key`;
/// later chunks start at the first key they receive. Every produced chunk
/// is an infant of the first frozen chunk until the rebalancer publishes
/// it.
pub(crate) fn compact<K: Key, V: Clone>(
    frozen: &[*mut Chunk<K, V>],
    scan_index: &mut ScanIndex<K>,
    config: &Config,
) -> Vec<Box<Chunk<K, V>>> {
    assert!(!frozen.is_empty(), "compaction needs an engaged run");

    let first_raw = frozen[0];
    // SAFETY: engaged chunks are kept alive by the caller's guard.
    let first = unsafe { &*first_raw };

    let low = u32::try_from(config.low_watermark).expect("watermark exceeds u32");
    let high = u32::try_from(config.high_watermark).expect("watermark exceeds u32");

    let mut compacted: Vec<Box<Chunk<K, V>>> = Vec::new();
    let mut dest = first.new_child(first.min_key(), first_raw);

    let mut at = 0_usize;
    // SAFETY: see above.
    let mut src = unsafe { &*frozen[at] };
    let mut oi = src.first_item();

    loop {
        oi = dest.copy_part(src, oi, low, scan_index);

        if oi == NONE {
            // Finished the current frozen chunk.
            at += 1;
            if at == frozen.len() {
                break;
            }
            // SAFETY: see above.
            src = unsafe { &*frozen[at] };
            oi = src.first_item();
            continue;
        }

        // Destination reached the low watermark. If the unmerged suffix is
        // short enough, finish it into this chunk instead of splitting.
        let suffix = &frozen[at..];
        if can_append_suffix(oi, suffix, config.max_append_range) {
            complete_copy(&dest, oi, suffix, scan_index, high);
            break;
        }

        // Seal this destination and open the next at the resume key.
        let next = first.new_child(src.key_at(oi), first_raw);
        let next_raw = std::ptr::from_ref(next.as_ref()).cast_mut();
        dest.set_next(next_raw);

        compacted.push(dest);
        dest = next;
    }

    compacted.push(dest);

    debug_log!(
        engaged = frozen.len(),
        produced = compacted.len(),
        "compaction finished"
    );

    compacted
}

/// Whether fewer than `max_count` items remain from `oi` to the end of the
/// frozen suffix. Bounded look-ahead: stops counting at `max_count`.
fn can_append_suffix<K: Key, V: Clone>(
    oi: u32,
    suffix: &[*mut Chunk<K, V>],
    max_count: usize,
) -> bool {
    let mut iter = MultiChunkIterator::from_position(oi, suffix);
    let mut counter = 1_usize;

    while iter.has_next() && counter < max_count {
        iter.next();
        counter += 1;
    }

    counter < max_count
}

/// Copy everything from `oi` to the end of `suffix` into `dest`, which is
/// guaranteed (by the look-ahead) to fit below `capacity`.
fn complete_copy<K: Key, V: Clone>(
    dest: &Chunk<K, V>,
    mut oi: u32,
    suffix: &[*mut Chunk<K, V>],
    scan_index: &mut ScanIndex<K>,
    capacity: u32,
) {
    let mut chunks = suffix.iter();
    // SAFETY: engaged chunks are kept alive by the caller's guard.
    let mut src = unsafe { &**chunks.next().expect("suffix is non-empty") };
    dest.copy_part(src, oi, capacity, scan_index);

    for &raw in chunks {
        // SAFETY: see above.
        src = unsafe { &*raw };
        oi = src.first_item();
        dest.copy_part(src, oi, capacity, scan_index);
    }
}
