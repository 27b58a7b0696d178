//! Stress tests for concurrent store operations.
//!
//! These tests are designed to expose race conditions through:
//! - High thread counts (8+ threads)
//! - Large key volumes (10k+ keys)
//! - Tiny chunks and aggressive rebalance triggers
//! - Mixed put/get/scan/delete workloads
//!
//! Run with:
//! ```bash
//! cargo test --test stress_tests --release
//! ```

#![allow(clippy::pedantic)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use kiwi::{Config, KiWi};

/// Tiny chunks + aggressive trigger probability: rebalancing runs often.
fn stress_config() -> Config {
    Config::default()
        .with_chunk_capacity(128)
        .with_max_workers(16)
        .with_rebalance_prob_pct(25)
}

fn spawn_workers<F>(threads: usize, f: F) -> Vec<thread::JoinHandle<()>>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    (0..threads)
        .map(|t| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(t))
        })
        .collect()
}

#[test]
fn concurrent_inserts_8_threads_10k_keys() {
    common::init_tracing();

    const THREADS: usize = 8;
    const TOTAL: u64 = 10_000;

    let store = Arc::new(KiWi::<u64, u64>::new(stress_config()));

    let handles = spawn_workers(THREADS, {
        let store = Arc::clone(&store);
        move |t| {
            // Thread t inserts keys congruent to t mod THREADS.
            let mut k = t as u64;
            while k < TOTAL {
                store.put(k, Some(k));
                k += THREADS as u64;
            }
        }
    });
    for h in handles {
        h.join().unwrap();
    }

    // Every key present and correct.
    for k in 0..TOTAL {
        assert_eq!(store.get(k), Some(k), "key {k} lost");
    }

    // A full scan returns exactly TOTAL distinct ascending values.
    let mut out = vec![0u64; TOTAL as usize];
    let n = store.scan(0, TOTAL - 1, &mut out);
    assert_eq!(n, TOTAL as usize);
    assert!(out.windows(2).all(|w| w[0] < w[1]), "scan not ascending");
}

#[test]
fn delete_half_then_scan_exact() {
    common::init_tracing();

    const THREADS: usize = 8;
    const TOTAL: u64 = 10_000;

    let store = Arc::new(KiWi::<u64, u64>::new(stress_config()));

    let handles = spawn_workers(THREADS, {
        let store = Arc::clone(&store);
        move |t| {
            let mut k = t as u64;
            while k < TOTAL {
                store.put(k, Some(k));
                k += THREADS as u64;
            }
        }
    });
    for h in handles {
        h.join().unwrap();
    }

    // Concurrently tombstone the lower half.
    let handles = spawn_workers(THREADS, {
        let store = Arc::clone(&store);
        move |t| {
            let mut k = t as u64;
            while k < TOTAL / 2 {
                store.put(k, None);
                k += THREADS as u64;
            }
        }
    });
    for h in handles {
        h.join().unwrap();
    }

    let mut out = vec![0u64; TOTAL as usize];
    let n = store.scan(0, TOTAL - 1, &mut out);
    assert_eq!(&out[..n], &(TOTAL / 2..TOTAL).collect::<Vec<_>>()[..]);
}

#[test]
fn no_lost_updates_same_key() {
    common::init_tracing();

    const THREADS: usize = 8;
    const ROUNDS: u64 = 500;

    let store = Arc::new(KiWi::<u64, u64>::new(stress_config()));

    let handles = spawn_workers(THREADS, {
        let store = Arc::clone(&store);
        move |t| {
            for i in 0..ROUNDS {
                // Everyone hammers key 42 with distinguishable values.
                store.put(42, Some(t as u64 * ROUNDS + i));
            }
        }
    });
    for h in handles {
        h.join().unwrap();
    }

    // Some write won; the value must be one that was actually written.
    let v = store.get(42).expect("key 42 vanished");
    let (t, i) = (v / ROUNDS, v % ROUNDS);
    assert!(t < THREADS as u64 && i < ROUNDS, "fabricated value {v}");
}

#[test]
fn mixed_readers_and_writers() {
    common::init_tracing();

    const WRITERS: usize = 4;
    const READERS: usize = 4;
    const KEYS: u64 = 2_000;

    let store = Arc::new(KiWi::<u64, u64>::new(stress_config()));
    let done = Arc::new(AtomicBool::new(false));

    let writer_handles = spawn_workers(WRITERS, {
        let store = Arc::clone(&store);
        move |t| {
            let mut k = t as u64;
            while k < KEYS {
                store.put(k, Some(k + 1));
                k += WRITERS as u64;
            }
        }
    });

    let reader_handles = spawn_workers(READERS, {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        move |_| {
            // Read until the writers finish; values are never torn.
            while !done.load(Ordering::Acquire) {
                for k in (0..KEYS).step_by(37) {
                    if let Some(v) = store.get(k) {
                        assert_eq!(v, k + 1, "torn read at key {k}");
                    }
                }
            }
        }
    });

    for h in writer_handles {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for h in reader_handles {
        h.join().unwrap();
    }

    for k in 0..KEYS {
        assert_eq!(store.get(k), Some(k + 1));
    }
}

#[test]
fn scan_under_mutation_sees_consistent_snapshot() {
    common::init_tracing();

    const KEYS: u64 = 1_000;
    const SCANS: usize = 50;

    let store = Arc::new(KiWi::<u64, u64>::new(stress_config()));

    // Every key maps to generation * KEYS + key. The writer bumps whole
    // generations; whatever mix of generations a scan catches, each value
    // must be intact and each key present exactly once.
    for k in 0..KEYS {
        store.put(k, Some(k));
    }

    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut generation = 1u64;
            while !done.load(Ordering::Acquire) {
                for k in 0..KEYS {
                    store.put(k, Some(generation * KEYS + k));
                }
                generation += 1;
            }
        })
    };

    let mut out = vec![0u64; KEYS as usize];
    for _ in 0..SCANS {
        let n = store.scan(0, KEYS - 1, &mut out);
        assert_eq!(n, KEYS as usize, "scan dropped keys mid-mutation");

        // Per-key integrity: value mod KEYS must equal the key.
        for (i, &v) in out[..n].iter().enumerate() {
            assert_eq!(v % KEYS, i as u64, "scan returned torn value {v}");
        }
    }

    done.store(true, Ordering::Release);
    writer.join().unwrap();
}

#[test]
fn interleaved_insert_and_delete_storm() {
    common::init_tracing();

    const THREADS: usize = 8;
    const KEYS: u64 = 4_000;

    let store = Arc::new(KiWi::<u64, u64>::new(stress_config()));

    let handles = spawn_workers(THREADS, {
        let store = Arc::clone(&store);
        move |t| {
            let mut k = t as u64;
            while k < KEYS {
                store.put(k, Some(k));
                // Every other owned key is immediately tombstoned.
                if k % 2 == 0 {
                    store.put(k, None);
                }
                k += THREADS as u64;
            }
        }
    });
    for h in handles {
        h.join().unwrap();
    }

    let mut out = vec![0u64; KEYS as usize];
    let n = store.scan(0, KEYS - 1, &mut out);

    let got: HashSet<u64> = out[..n].iter().copied().collect();
    let expected: HashSet<u64> = (0..KEYS).filter(|k| k % 2 == 1).collect();
    assert_eq!(got, expected);
}

#[test]
fn many_stores_do_not_interfere() {
    common::init_tracing();

    let a = Arc::new(KiWi::<u64, u64>::new(stress_config()));
    let b = Arc::new(KiWi::<u64, u64>::new(stress_config()));

    let handles: Vec<_> = [Arc::clone(&a), Arc::clone(&b)]
        .into_iter()
        .enumerate()
        .flat_map(|(which, store)| {
            (0..4).map(move |t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for k in 0..500u64 {
                        store.put(k, Some(which as u64 * 10_000 + k));
                    }
                    let _ = t;
                })
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(a.get(7), Some(7));
    assert_eq!(b.get(7), Some(10_007));
}
