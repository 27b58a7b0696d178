//! Property tests: the store agrees with a `BTreeMap` model.
//!
//! Sequential op sequences run against both the store (with tiny chunks so
//! rebalancing fires constantly) and a reference `BTreeMap`; every lookup
//! and scan must agree. This is the compaction-correctness property: the
//! visible key-value set is independent of how often chunks were merged
//! and split underneath.

#![allow(clippy::pedantic)]

mod common;

use std::collections::BTreeMap;

use proptest::prelude::*;

use kiwi::{Config, KiWi};

#[derive(Debug, Clone)]
enum Op {
    Put(u16, u64),
    Remove(u16),
    Get(u16),
    Scan(u16, u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // Narrow key space so overwrites, removes, and scans collide often.
    prop_oneof![
        (any::<u16>(), any::<u64>()).prop_map(|(k, v)| Op::Put(k % 512, v)),
        any::<u16>().prop_map(|k| Op::Remove(k % 512)),
        any::<u16>().prop_map(|k| Op::Get(k % 512)),
        (any::<u16>(), any::<u16>()).prop_map(|(a, b)| Op::Scan(a % 512, b % 512)),
    ]
}

fn tiny_config() -> Config {
    Config::default()
        .with_chunk_capacity(32)
        .with_max_workers(2)
        .with_rebalance_prob_pct(100)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn store_matches_btreemap_model(ops in prop::collection::vec(op_strategy(), 1..400)) {
        common::init_tracing();

        let store: KiWi<u64, u64> = KiWi::new(tiny_config());
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(k, v) => {
                    store.put(u64::from(k), Some(v));
                    model.insert(u64::from(k), v);
                }
                Op::Remove(k) => {
                    store.put(u64::from(k), None);
                    model.remove(&u64::from(k));
                }
                Op::Get(k) => {
                    prop_assert_eq!(store.get(u64::from(k)), model.get(&u64::from(k)).copied());
                }
                Op::Scan(a, b) => {
                    let (min, max) = (u64::from(a.min(b)), u64::from(a.max(b)));

                    let mut out = vec![0u64; 600];
                    let n = store.scan(min, max, &mut out);

                    let expected: Vec<u64> =
                        model.range(min..=max).map(|(_, &v)| v).collect();
                    prop_assert_eq!(&out[..n], &expected[..]);
                }
            }
        }

        // Final full agreement.
        let mut out = vec![0u64; 600];
        let n = store.scan(0, u64::MAX, &mut out);
        let expected: Vec<u64> = model.values().copied().collect();
        prop_assert_eq!(&out[..n], &expected[..]);
    }

    #[test]
    fn overwrite_last_write_wins(
        key in any::<u16>(),
        values in prop::collection::vec(any::<u64>(), 1..50),
    ) {
        let store: KiWi<u64, u64> = KiWi::new(tiny_config());

        for &v in &values {
            store.put(u64::from(key), Some(v));
        }

        prop_assert_eq!(store.get(u64::from(key)), values.last().copied());
    }

    #[test]
    fn tombstones_are_idempotent(keys in prop::collection::vec(any::<u8>(), 1..100)) {
        let store: KiWi<u64, u64> = KiWi::new(tiny_config());

        for &k in &keys {
            store.put(u64::from(k), Some(u64::from(k)));
        }
        for &k in &keys {
            store.put(u64::from(k), None);
            store.put(u64::from(k), None);
            prop_assert_eq!(store.get(u64::from(k)), None);
        }

        let mut out = vec![0u64; 300];
        prop_assert_eq!(store.scan(0, u64::MAX, &mut out), 0);
    }
}
