use std::collections::BTreeMap;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::{ArtTree, Value};

/// Simple model implementation using BTreeMap for comparison. Absent
/// keys read as the null token, matching the tree.
#[derive(Default, Clone)]
struct Model {
    map: BTreeMap<u64, u64>,
}

impl Model {
    fn insert(&mut self, key: u64, value: u64) {
        self.map.insert(key, value);
    }

    fn range_insert(&mut self, start: u64, length: u32, value: u64) {
        for i in 0..length as u64 {
            self.map.insert(start + i, value);
        }
    }

    fn get(&self, key: u64) -> u64 {
        self.map.get(&key).copied().unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Wrapper for key generation with clustered strategies so shared
/// prefixes, splits and every node layout get exercised.
#[derive(Debug, Clone, Copy)]
struct Key(u64);

impl Arbitrary for Key {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            // Dense low keys sharing their whole upper prefix
            (0u64..2048).prop_map(Key),
            // Fully random keys
            any::<u64>().prop_map(Key),
            // Keys clustered in the low 32 bits
            any::<u64>().prop_map(|k| Key(k & 0xFFFF_FFFF)),
            // Keys diverging only in the top byte
            (0u64..16, 0u64..4).prop_map(|(hi, lo)| Key((hi << 56) | 0xAB_CD00 | lo)),
            // Keys at the top of the space
            any::<u64>().prop_map(|k| Key(k | 0xFF00_0000_0000_0000)),
        ]
        .boxed()
    }
}

/// A range honoring the single-leaf constraint.
#[derive(Debug, Clone, Copy)]
struct RangeSpec {
    start: u64,
    length: u32,
}

impl Arbitrary for RangeSpec {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (any::<Key>(), 0u32..256)
            .prop_map(|(Key(start), raw)| {
                let cap = 256 - (start % 256) as u32;
                RangeSpec {
                    start,
                    length: 1 + raw % cap,
                }
            })
            .boxed()
    }
}

/// Non-null token, so a model miss (zero) never collides with a hit.
#[derive(Debug, Clone, Copy)]
struct Token(u64);

impl Arbitrary for Token {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (1u64..=u64::MAX).prop_map(Token).boxed()
    }
}

/// Actions to test against both implementations
#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Insert(Key, Token),
    RangeInsert(RangeSpec, Token),
    Search(Key),
    RangeQuery(RangeSpec),
}

/// Test harness that executes actions on both ArtTree and Model
#[derive(Default)]
struct Test {
    tree: ArtTree,
    model: Model,
}

impl Test {
    fn execute(&mut self, action: Action) {
        match action {
            Action::Insert(Key(key), Token(value)) => {
                self.tree.insert(key, Value(value));
                self.model.insert(key, value);
            }
            Action::RangeInsert(spec, Token(value)) => {
                self.tree.range_insert(spec.start, spec.length, Value(value));
                self.model.range_insert(spec.start, spec.length, value);
            }
            Action::Search(Key(key)) => {
                assert_eq!(
                    self.tree.search(key),
                    Value(self.model.get(key)),
                    "search mismatch for key {key:#x}",
                );
            }
            Action::RangeQuery(spec) => {
                let got = self.tree.range_query(spec.start, spec.length);
                for (i, v) in got.iter().enumerate() {
                    let key = spec.start + i as u64;
                    assert_eq!(
                        *v,
                        Value(self.model.get(key)),
                        "range query mismatch for key {key:#x}",
                    );
                }
            }
        }
    }

    fn check_against_model(&self) {
        for (&key, &value) in &self.model.map {
            assert_eq!(self.tree.search(key), Value(value), "key {key:#x}");
        }
        assert_eq!(self.tree.len(), self.model.len() as u64);
        let issues = self.tree.verify_integrity();
        assert!(issues.is_empty(), "{issues:?}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn proptest_vs_btreemap(actions in prop::collection::vec(any::<Action>(), 1..64)) {
        let mut test = Test::default();
        for action in actions {
            test.execute(action);
        }
        test.check_against_model();
    }

    #[test]
    fn proptest_snapshot_roundtrip(actions in prop::collection::vec(any::<Action>(), 1..48)) {
        let mut test = Test::default();
        for action in actions {
            test.execute(action);
        }

        let snapshot = test.tree.serialize();
        let reloaded = ArtTree::deserialize(&snapshot).unwrap();
        for (&key, &value) in &test.model.map {
            prop_assert_eq!(reloaded.search(key), Value(value), "key {:#x}", key);
        }
        prop_assert_eq!(reloaded.len(), test.model.len() as u64);
        prop_assert_eq!(reloaded.memory_stats(), test.tree.memory_stats());
        prop_assert!(reloaded.verify_integrity().is_empty());
    }
}
