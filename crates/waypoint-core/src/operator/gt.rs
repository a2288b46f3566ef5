//! Generalized transforms: tuple-at-a-time, chunk in, chunk out

use super::state::{ConstantInputs, ConstantState};
use crate::chunk::{Chunk, ChunkBuilder, DataType, MAX_QUERIES, QueryId, QueryIdSet, SlotId, Value};
use crate::error::Result;

/// Per-query transform state, rebuilt for every chunk
pub trait Gt: Send + Sized + 'static {
    /// Read-only state shared by all workers of one query
    type Constant: Clone + Send + Sync + 'static;

    /// State for one chunk
    fn init(constant: &Self::Constant) -> Self;

    /// Called before the first tuple of a chunk
    fn pre_chunk(&mut self) {}

    /// Transform one tuple, appending zero or more output rows
    fn process_tuple(&mut self, row: &[Value], out: &mut Vec<Vec<Value>>) -> Result<()>;

    /// Called after the last tuple of a chunk
    fn chunk_boundary(&mut self) {}
}

/// Plan-time description of a transform waypoint
pub trait GtDescriptor: Send + Sync + 'static {
    /// Per-chunk state
    type State: Gt;

    /// Slots projected into `process_tuple`
    fn inputs(&self) -> Vec<SlotId>;

    /// Slots and types of emitted rows
    fn output_schema(&self) -> Vec<(SlotId, DataType)>;

    /// Build a query's constant state (PreProcess)
    fn constant(&self, query: QueryId, upstream: &ConstantInputs) -> Result<<Self::State as Gt>::Constant>;
}

/// Object-safe transform interface the engine drives
pub trait GtOps: Send + Sync {
    /// Output slots and types
    fn output_schema(&self) -> Vec<(SlotId, DataType)>;
    /// Allocate a query's constant state
    fn pre_process(&self, query: QueryId, upstream: &ConstantInputs) -> Result<ConstantState>;
    /// Transform a chunk for the given queries
    fn process_chunk(&self, chunk: &Chunk, constants: &[(QueryId, ConstantState)]) -> Result<Chunk>;
}

impl<D: GtDescriptor> GtOps for D {
    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        GtDescriptor::output_schema(self)
    }

    fn pre_process(&self, query: QueryId, upstream: &ConstantInputs) -> Result<ConstantState> {
        Ok(ConstantState::new(self.constant(query, upstream)?))
    }

    /// Rows that several queries produce identically from the same tuple are
    /// emitted once with the union of those queries.
    fn process_chunk(&self, chunk: &Chunk, constants: &[(QueryId, ConstantState)]) -> Result<Chunk> {
        let inputs = self.inputs();
        let mut position = [usize::MAX; MAX_QUERIES];
        for (i, (query, _)) in constants.iter().enumerate() {
            position[query.index()] = i;
        }
        let running: QueryIdSet = constants.iter().map(|(q, _)| *q).collect();

        let mut states: Vec<Option<D::State>> = constants.iter().map(|_| None).collect();
        let mut builder = ChunkBuilder::new(&GtDescriptor::output_schema(self));
        let mut emitted = Vec::new();
        let mut tuple_rows: Vec<(Vec<Value>, QueryIdSet)> = Vec::new();

        for (tuple, mask) in chunk.bitstring().iter().enumerate() {
            let live = mask.intersect(running);
            if live.is_empty() {
                continue;
            }
            let row = chunk.row(tuple, &inputs)?;
            tuple_rows.clear();
            for query in live {
                let i = position[query.index()];
                let state = match &mut states[i] {
                    Some(state) => state,
                    empty => {
                        let constant = constants[i].1.get::<<D::State as Gt>::Constant>()?;
                        let mut fresh = D::State::init(constant);
                        fresh.pre_chunk();
                        empty.insert(fresh)
                    }
                };
                emitted.clear();
                state.process_tuple(&row, &mut emitted)?;
                let bit = QueryIdSet::single(query);
                for out in emitted.drain(..) {
                    match tuple_rows.iter_mut().find(|(r, _)| *r == out) {
                        Some((_, m)) => *m = m.union(bit),
                        None => tuple_rows.push((out, bit)),
                    }
                }
            }
            for (out, m) in tuple_rows.drain(..) {
                builder.push_row(out, m)?;
            }
        }
        for state in states.iter_mut().flatten() {
            state.chunk_boundary();
        }
        Ok(builder.finish()?.with_sequence(chunk.sequence()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Column;
    use crate::operator::library::{Filter, Scale};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Hooks {
        pre: AtomicUsize,
        boundary: AtomicUsize,
    }

    /// Passes tuples through and counts chunk hooks
    struct Passthrough {
        hooks: Arc<Hooks>,
    }

    impl Gt for Passthrough {
        type Constant = Arc<Hooks>;

        fn init(constant: &Arc<Hooks>) -> Self {
            Self { hooks: constant.clone() }
        }

        fn pre_chunk(&mut self) {
            self.hooks.pre.fetch_add(1, Ordering::SeqCst);
        }

        fn process_tuple(&mut self, row: &[Value], out: &mut Vec<Vec<Value>>) -> Result<()> {
            out.push(row.to_vec());
            Ok(())
        }

        fn chunk_boundary(&mut self) {
            self.hooks.boundary.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PassthroughOp {
        hooks: Arc<Hooks>,
    }

    impl GtDescriptor for PassthroughOp {
        type State = Passthrough;

        fn inputs(&self) -> Vec<SlotId> {
            vec![0]
        }

        fn output_schema(&self) -> Vec<(SlotId, DataType)> {
            vec![(0, DataType::Int64)]
        }

        fn constant(&self, _query: QueryId, _upstream: &ConstantInputs) -> Result<Arc<Hooks>> {
            Ok(self.hooks.clone())
        }
    }

    fn q(i: usize) -> QueryId {
        QueryId::new(i).unwrap()
    }

    #[test]
    fn test_identical_outputs_share_a_row() {
        let ops: &dyn GtOps = &Scale::new(0, 2.0);
        let constants = vec![
            (q(0), ops.pre_process(q(0), &ConstantInputs::default()).unwrap()),
            (q(1), ops.pre_process(q(1), &ConstantInputs::default()).unwrap()),
        ];
        let both = QueryIdSet::first_n(2);
        let chunk = Chunk::new(
            vec![(0, Column::from(vec![1.5f64, 4.0]))],
            vec![both, QueryIdSet::single(q(1))],
        )
        .unwrap()
        .with_sequence(3);
        let out = ops.process_chunk(&chunk, &constants).unwrap();
        assert_eq!(out.sequence(), 3);
        assert_eq!(out.num_tuples(), 2);
        assert_eq!(out.bitstring(), &[both, QueryIdSet::single(q(1))]);
        assert_eq!(out.row(0, &[0]).unwrap(), vec![Value::Float64(3.0)]);
    }

    #[test]
    fn test_filter_drops_rows() {
        let ops: &dyn GtOps = &Filter::new(vec![(0, DataType::Int64), (1, DataType::Utf8)], 0, 10.0);
        let constants = vec![(q(0), ops.pre_process(q(0), &ConstantInputs::default()).unwrap())];
        let chunk = Chunk::uniform(
            vec![
                (0, Column::from(vec![5i64, 15, 25])),
                (1, Column::from(vec!["a".to_string(), "b".to_string(), "c".to_string()])),
            ],
            QueryIdSet::single(q(0)),
        )
        .unwrap();
        let out = ops.process_chunk(&chunk, &constants).unwrap();
        assert_eq!(out.num_tuples(), 2);
        assert_eq!(out.row(0, &[0, 1]).unwrap(), vec![Value::Int64(15), Value::Utf8("b".into())]);
    }

    #[test]
    fn test_chunk_hooks_run_once_per_query_and_chunk() {
        let hooks = Arc::new(Hooks::default());
        let op = PassthroughOp { hooks: hooks.clone() };
        let ops: &dyn GtOps = &op;
        let constants = vec![
            (q(0), ops.pre_process(q(0), &ConstantInputs::default()).unwrap()),
            (q(1), ops.pre_process(q(1), &ConstantInputs::default()).unwrap()),
        ];
        let only_q0 = Chunk::uniform(vec![(0, Column::from(vec![1i64, 2, 3]))], QueryIdSet::single(q(0))).unwrap();
        let both = Chunk::uniform(vec![(0, Column::from(vec![4i64, 5]))], QueryIdSet::first_n(2)).unwrap();

        ops.process_chunk(&only_q0, &constants).unwrap();
        assert_eq!(hooks.pre.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.boundary.load(Ordering::SeqCst), 1);

        let out = ops.process_chunk(&both, &constants).unwrap();
        assert_eq!(out.num_tuples(), 2);
        assert_eq!(hooks.pre.load(Ordering::SeqCst), 3);
        assert_eq!(hooks.boundary.load(Ordering::SeqCst), 3);
    }
}
