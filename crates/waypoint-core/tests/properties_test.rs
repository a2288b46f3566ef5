//! Property tests for the accounting and encoding invariants

use proptest::prelude::*;
use waypoint_core::chunk::{Chunk, Column, QueryId, QueryIdSet, Value, compact};
use waypoint_core::config::TokenConfig;
use waypoint_core::hash::{RecordBuilder, RecordView};
use waypoint_core::operator::Gla;
use waypoint_core::operator::library::GroupCountState;
use waypoint_core::tokens::{HIGHEST_PRIORITY, TokenKind, TokenPool, WorkToken};

#[derive(Debug, Clone)]
enum TokenOp {
    Acquire(bool),
    Release(usize),
}

fn token_op() -> impl Strategy<Value = TokenOp> {
    prop_oneof![
        any::<bool>().prop_map(TokenOp::Acquire),
        any::<usize>().prop_map(TokenOp::Release),
    ]
}

fn group_states(groups: &[Vec<i64>]) -> Vec<GroupCountState> {
    groups
        .iter()
        .map(|keys| {
            let mut state = GroupCountState::init(&2);
            for key in keys {
                state.add_item(&[Value::Int64(*key)]).unwrap();
            }
            state
        })
        .collect()
}

fn sorted_output(state: &GroupCountState) -> Vec<Vec<Value>> {
    let mut rows: Vec<Vec<Value>> = (0..state.num_fragments())
        .flat_map(|f| state.finalize(f).unwrap())
        .collect();
    rows.sort_by_key(|r| r[0].as_i64());
    rows
}

proptest! {
    #[test]
    fn test_tokens_are_conserved(ops in prop::collection::vec(token_op(), 1..200)) {
        let pool = TokenPool::new(&TokenConfig {
            cpu_tokens: 3,
            disk_tokens: 2,
            cleaner_cpu_tokens: 1,
            cleaner_disk_tokens: 1,
        })
        .unwrap();
        let mut held: Vec<WorkToken> = Vec::new();

        for op in ops {
            match op {
                TokenOp::Acquire(cpu) => {
                    let kind = if cpu { TokenKind::Cpu } else { TokenKind::Disk };
                    if let Some(token) = pool.try_acquire(kind, HIGHEST_PRIORITY) {
                        prop_assert_eq!(token.kind(), kind);
                        held.push(token);
                    }
                }
                TokenOp::Release(i) if !held.is_empty() => {
                    let token = held.swap_remove(i % held.len());
                    pool.release(token);
                }
                TokenOp::Release(_) => {}
            }

            for kind in [TokenKind::Cpu, TokenKind::Disk] {
                let stats = pool.stats(kind);
                let mine = held.iter().filter(|t| t.kind() == kind).count();
                prop_assert_eq!(stats.outstanding, mine);
                prop_assert!(stats.outstanding <= stats.capacity);
                prop_assert_eq!(stats.issued - stats.released, stats.outstanding as u64);
            }
        }

        let mut labels: Vec<u32> = held.iter().map(WorkToken::label).collect();
        labels.sort_unstable();
        labels.dedup();
        prop_assert_eq!(labels.len(), held.len());
    }

    #[test]
    fn test_record_fields_read_back(
        bits in any::<u64>(),
        fields in prop::collection::btree_map(any::<u16>(), prop::collection::vec(any::<u8>(), 0..24), 0..12),
        lookups in prop::collection::vec(any::<u16>(), 0..16),
    ) {
        let mut builder = RecordBuilder::new(QueryIdSet::from_bits(bits));
        for (slot, bytes) in &fields {
            builder.field(*slot, bytes).unwrap();
        }
        let encoded = builder.finish();
        let record = RecordView::parse(&encoded).unwrap();

        prop_assert_eq!(record.bitstring().bits(), bits);
        let stored: Vec<(u16, Vec<u8>)> = record
            .fields()
            .map(|f| f.map(|(s, b)| (s, b.to_vec())))
            .collect::<Result<_, _>>()
            .unwrap();
        let expected: Vec<(u16, Vec<u8>)> = fields.clone().into_iter().collect();
        prop_assert_eq!(stored, expected);

        // lookups in any order, including slots never written
        for slot in lookups {
            prop_assert_eq!(record.field(slot).unwrap(), fields.get(&slot).map(Vec::as_slice));
        }
    }

    #[test]
    fn test_truncated_records_are_rejected(
        fields in prop::collection::btree_map(any::<u16>(), prop::collection::vec(any::<u8>(), 1..8), 1..6),
        cut in 1usize..8,
    ) {
        let mut builder = RecordBuilder::new(QueryIdSet::from_bits(1));
        for (slot, bytes) in &fields {
            builder.field(*slot, bytes).unwrap();
        }
        let encoded = builder.finish();
        let cut = cut.min(encoded.len());
        prop_assert!(RecordView::parse(&encoded[..encoded.len() - cut]).is_err());
    }

    #[test]
    fn test_group_merge_is_associative_and_commutative(
        groups in prop::collection::vec(prop::collection::vec(0i64..20, 0..30), 1..6),
    ) {
        // ((a + b) + c) ...
        let mut left = group_states(&groups).into_iter();
        let mut folded = left.next().unwrap();
        for state in left {
            folded.add_state(state);
        }

        // ... == a + (b + (c + ...)), merged in reverse
        let mut right = group_states(&groups);
        let mut acc = right.pop().unwrap();
        while let Some(mut state) = right.pop() {
            state.add_state(acc);
            acc = state;
        }

        // ... == one state over every key
        let flat: Vec<i64> = groups.concat();
        let single = group_states(&[flat.clone()]).pop().unwrap();

        prop_assert_eq!(sorted_output(&folded), sorted_output(&acc));
        prop_assert_eq!(sorted_output(&folded), sorted_output(&single));
        let total: i64 = sorted_output(&folded).iter().map(|r| r[1].as_i64().unwrap()).sum();
        prop_assert_eq!(total as usize, flat.len());
    }

    #[test]
    fn test_compact_keeps_exactly_live_tuples(
        masks in prop::collection::vec(0u64..16, 1..40),
        keep in 0u64..16,
    ) {
        let values: Vec<i64> = (0..masks.len() as i64).collect();
        let bitstring: Vec<QueryIdSet> = masks.iter().map(|m| QueryIdSet::from_bits(*m)).collect();
        let chunk = Chunk::new(vec![(0, Column::from(values))], bitstring).unwrap().with_sequence(4);
        let queries = QueryIdSet::from_bits(keep);

        let out = compact(chunk, queries).unwrap();
        let expected: Vec<i64> = masks
            .iter()
            .enumerate()
            .filter(|(_, m)| *m & keep != 0)
            .map(|(i, _)| i as i64)
            .collect();
        let got: Vec<i64> = (0..out.num_tuples())
            .map(|t| out.row(t, &[0]).unwrap()[0].as_i64().unwrap())
            .collect();
        prop_assert_eq!(got, expected);
        prop_assert_eq!(out.sequence(), 4);
        prop_assert!(out.bitstring().iter().all(|m| m.overlaps(queries)));
    }
}

#[test]
fn test_query_sets_cover_every_id() {
    let all: QueryIdSet = (0..64).map(|i| QueryId::new(i).unwrap()).collect();
    assert_eq!(all.len(), 64);
    assert_eq!(all.iter().count(), 64);
}
