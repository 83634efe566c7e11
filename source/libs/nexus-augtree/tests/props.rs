// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for the augmented red-black tree
//! OWNERS: @kernel-mm-team
//!
//! TEST_SCOPE:
//!   - Red-black shape and summaries survive arbitrary insert/remove mixes
//!   - In-order iteration matches a BTreeSet model
//!
//! TEST_SCENARIOS:
//!   - mixed_ops_match_model(): random insert/remove sequence vs. BTreeSet
//!   - subtree_sum_tracks_values(): root summary equals the model sum

use std::collections::BTreeSet;

use nexus_augtree::{AugTree, Augment};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
struct Key(u16);

impl Augment for Key {
    type Key = u16;
    type Summary = u64;

    fn key(&self) -> u16 {
        self.0
    }

    fn summarize(&self, left: Option<&u64>, right: Option<&u64>) -> u64 {
        u64::from(self.0) + left.copied().unwrap_or(0) + right.copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u16),
    Remove(u16),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u16..512).prop_map(Op::Insert), (0u16..512).prop_map(Op::Remove)]
}

proptest! {
    #[test]
    fn mixed_ops_match_model(ops in proptest::collection::vec(arb_op(), 1..300)) {
        let mut tree = AugTree::new();
        let mut model = BTreeSet::new();
        for op in ops {
            match op {
                Op::Insert(k) => {
                    let inserted = tree.insert(Key(k)).is_ok();
                    prop_assert_eq!(inserted, model.insert(k));
                }
                Op::Remove(k) => {
                    if let Some(id) = tree.floor(k).filter(|id| tree.get(*id).0 == k) {
                        tree.remove(id);
                        prop_assert!(model.remove(&k));
                    } else {
                        prop_assert!(!model.contains(&k));
                    }
                }
            }
            prop_assert_eq!(tree.verify(), Ok(()));
        }
        let keys: Vec<u16> = tree.iter().map(|(_, v)| v.0).collect();
        let expected: Vec<u16> = model.iter().copied().collect();
        prop_assert_eq!(keys, expected);
    }

    #[test]
    fn subtree_sum_tracks_values(keys in proptest::collection::btree_set(0u16..2000, 0..200)) {
        let mut tree = AugTree::new();
        for k in &keys {
            tree.insert(Key(*k)).unwrap();
        }
        let total: u64 = keys.iter().map(|k| u64::from(*k)).sum();
        let root_sum = tree.root().map_or(0, |r| *tree.summary(r));
        prop_assert_eq!(root_sum, total);
    }
}
