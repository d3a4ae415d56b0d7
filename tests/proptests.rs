use std::collections::{BTreeMap, BTreeSet};

use kira_kmer_algebra::*;
use proptest::prelude::*;

const K: usize = 5;

/// Up to `max_inputs` sorted, duplicate-free streams over a small k-mer space
/// so that ties are common.
fn streams(max_inputs: usize) -> impl Strategy<Value = Vec<Vec<(u64, u64)>>> {
    prop::collection::vec(
        prop::collection::btree_map(0u64..64, 1u64..20, 0..40)
            .prop_map(|m| m.into_iter().collect::<Vec<_>>()),
        1..=max_inputs,
    )
}

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Union),
        Just(Operation::UnionMin),
        Just(Operation::UnionMax),
        Just(Operation::UnionSum),
        Just(Operation::Intersect),
        Just(Operation::IntersectMin),
        Just(Operation::IntersectMax),
        Just(Operation::IntersectSum),
        Just(Operation::Difference),
        Just(Operation::SymmetricDifference),
        Just(Operation::Compare),
        Just(Operation::Histogram),
        Just(Operation::Nothing),
        (0u64..20).prop_map(Operation::LessThan),
        (0u64..20).prop_map(Operation::GreaterThan),
        (0u64..20).prop_map(Operation::AtLeast),
        (0u64..20).prop_map(Operation::AtMost),
        (0u64..20).prop_map(Operation::EqualTo),
        (0u64..20).prop_map(Operation::NotEqualTo),
        (0u64..20).prop_map(Operation::Increase),
        (0u64..20).prop_map(Operation::Decrease),
        (0u64..5).prop_map(Operation::Multiply),
        (0u64..5).prop_map(Operation::Divide),
        (0u64..5).prop_map(Operation::Modulo),
    ]
}

fn inputs(streams: &[Vec<(u64, u64)>]) -> Vec<Input> {
    streams
        .iter()
        .enumerate()
        .map(|(i, s)| {
            MemoryInput::new(
                format!("in{i}"),
                K,
                s.iter().map(|&(k, c)| (Kmer(k), c)).collect(),
            )
            .into()
        })
        .collect()
}

fn merge(op: Operation, streams: &[Vec<(u64, u64)>]) -> Vec<(Kmer, u64)> {
    let sink = MemorySink::new();
    let mut node = OperationNode::new(op, inputs(streams))
        .unwrap()
        .with_report(Box::new(std::io::sink()))
        .with_output(Box::new(sink.clone()));
    node.run().unwrap();
    sink.records()
}

proptest! {
    #[test]
    fn prop_output_strictly_increasing(op in operation(), s in streams(5)) {
        let out = merge(op, &s);
        for w in out.windows(2) {
            prop_assert!(w[0].0 < w[1].0);
        }
        for (_, c) in &out {
            prop_assert!(*c > 0);
        }
    }

    #[test]
    fn prop_union_sum_matches_reference(s in streams(4)) {
        let mut expect = BTreeMap::<u64, u64>::new();
        for st in &s {
            for &(k, c) in st {
                *expect.entry(k).or_insert(0) += c;
            }
        }
        let expect: Vec<(Kmer, u64)> = expect.into_iter().map(|(k, c)| (Kmer(k), c)).collect();
        prop_assert_eq!(merge(Operation::UnionSum, &s), expect);
    }

    #[test]
    fn prop_intersect_min_matches_reference(s in streams(4)) {
        let mut keys: BTreeSet<u64> = s[0].iter().map(|r| r.0).collect();
        for st in &s[1..] {
            let other: BTreeSet<u64> = st.iter().map(|r| r.0).collect();
            keys = keys.intersection(&other).copied().collect();
        }
        let expect: Vec<(Kmer, u64)> = keys
            .into_iter()
            .map(|k| {
                let min = s
                    .iter()
                    .filter_map(|st| st.iter().find(|r| r.0 == k).map(|r| r.1))
                    .min()
                    .unwrap();
                (Kmer(k), min)
            })
            .collect();
        prop_assert_eq!(merge(Operation::IntersectMin, &s), expect);
    }

    #[test]
    fn prop_nested_pass_through_is_identity(s in streams(1)) {
        let inner = OperationNode::new(Operation::PassThrough, inputs(&s)).unwrap();
        let sink = MemorySink::new();
        let mut outer = OperationNode::new(Operation::PassThrough, vec![inner.into()])
            .unwrap()
            .with_output(Box::new(sink.clone()));
        outer.run().unwrap();
        let expect: Vec<(Kmer, u64)> = s[0].iter().map(|&(k, c)| (Kmer(k), c)).collect();
        prop_assert_eq!(sink.records(), expect);
    }
}
