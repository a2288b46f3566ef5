//! Generalized linear aggregates

use super::state::{ConstantInputs, ConstantState, OperatorState};
use crate::chunk::{Chunk, ChunkBuilder, DataType, MAX_QUERIES, QueryId, QueryIdSet, SlotId, Value};
use crate::error::{Error, Result};
use rayon::prelude::*;

/// Per-query accumulator of an aggregate.
///
/// `add_state` must be associative and commutative: partial states are
/// merged in whatever order workers finish.
pub trait Gla: Send + Sync + Sized + 'static {
    /// Read-only state shared by all accumulators of one query
    type Constant: Clone + Send + Sync + 'static;

    /// Fresh accumulator seeded from the constant state
    fn init(constant: &Self::Constant) -> Self;

    /// Called before the first tuple of a chunk
    fn pre_chunk(&mut self) {}

    /// Feed one projected tuple
    fn add_item(&mut self, row: &[Value]) -> Result<()>;

    /// Called after the last tuple of a chunk
    fn chunk_boundary(&mut self) {}

    /// Fold another partial state into this one
    fn add_state(&mut self, other: Self);

    /// Decide after a full pass whether to run another. May update the
    /// constant the next pass starts from.
    fn should_iterate(&mut self, _constant: &mut Self::Constant) -> bool {
        false
    }

    /// Number of finalize fragments
    fn num_fragments(&self) -> usize {
        1
    }

    /// Output rows of one fragment
    fn finalize(&self, fragment: usize) -> Result<Vec<Vec<Value>>>;
}

/// Plan-time description of an aggregate waypoint
pub trait GlaDescriptor: Send + Sync + 'static {
    /// Accumulator type
    type State: Gla;

    /// Slots projected into `add_item`, in row order
    fn inputs(&self) -> Vec<SlotId>;

    /// Slots and types of finalized rows
    fn output_schema(&self) -> Vec<(SlotId, DataType)>;

    /// Build a query's constant state (PreProcess)
    fn constant(&self, query: QueryId, upstream: &ConstantInputs) -> Result<<Self::State as Gla>::Constant>;

    /// True when `should_iterate` can return true; input chunks are then
    /// kept for replay
    fn iterative(&self) -> bool {
        false
    }

    /// Hand the merged state downstream as a constant instead of emitting rows
    fn finalize_as_state(&self) -> bool {
        false
    }

    /// Emit the rows of every pass, not only the last
    fn produce_intermediates(&self, _query: QueryId) -> bool {
        false
    }

    /// Cleanup after a query finalized
    fn post_finalize(&self, _query: QueryId) {}
}

/// What PreFinalize decided for one query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreFinalize {
    /// Run another pass over the same input
    pub iterate: bool,
    /// Fragments to finalize
    pub fragments: usize,
}

/// Object-safe aggregate interface the engine drives
pub trait GlaOps: Send + Sync {
    /// Output slots and types
    fn output_schema(&self) -> Vec<(SlotId, DataType)>;
    /// See [`GlaDescriptor::iterative`]
    fn iterative(&self) -> bool;
    /// See [`GlaDescriptor::finalize_as_state`]
    fn finalize_as_state(&self) -> bool;
    /// See [`GlaDescriptor::produce_intermediates`]
    fn produce_intermediates(&self, query: QueryId) -> bool;
    /// Allocate a query's constant state
    fn pre_process(&self, query: QueryId, upstream: &ConstantInputs) -> Result<ConstantState>;
    /// Accumulate one chunk; returns a partial state per query that saw tuples
    fn process_chunk(
        &self,
        chunk: &Chunk,
        constants: &[(QueryId, ConstantState)],
    ) -> Result<Vec<(QueryId, OperatorState)>>;
    /// Merge partial states of one query
    fn merge_states(&self, states: Vec<OperatorState>) -> Result<OperatorState>;
    /// Decide between iterating and finalizing. A query that saw no tuple
    /// gets a fresh state.
    fn pre_finalize(
        &self,
        state: Option<OperatorState>,
        constant: &mut ConstantState,
    ) -> Result<(OperatorState, PreFinalize)>;
    /// Rows of one fragment, tagged with the query
    fn finalize(&self, query: QueryId, state: &OperatorState, fragment: usize) -> Result<Chunk>;
    /// Convert the merged state into a constant for downstream waypoints
    fn into_constant(&self, state: OperatorState) -> Result<ConstantState>;
    /// See [`GlaDescriptor::post_finalize`]
    fn post_finalize(&self, query: QueryId);
}

impl<D: GlaDescriptor> GlaOps for D {
    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        GlaDescriptor::output_schema(self)
    }

    fn iterative(&self) -> bool {
        GlaDescriptor::iterative(self)
    }

    fn finalize_as_state(&self) -> bool {
        GlaDescriptor::finalize_as_state(self)
    }

    fn produce_intermediates(&self, query: QueryId) -> bool {
        GlaDescriptor::produce_intermediates(self, query)
    }

    fn pre_process(&self, query: QueryId, upstream: &ConstantInputs) -> Result<ConstantState> {
        Ok(ConstantState::new(self.constant(query, upstream)?))
    }

    fn process_chunk(
        &self,
        chunk: &Chunk,
        constants: &[(QueryId, ConstantState)],
    ) -> Result<Vec<(QueryId, OperatorState)>> {
        let inputs = self.inputs();
        let mut position = [usize::MAX; MAX_QUERIES];
        for (i, (query, _)) in constants.iter().enumerate() {
            position[query.index()] = i;
        }
        let running: QueryIdSet = constants.iter().map(|(q, _)| *q).collect();

        let mut states: Vec<Option<D::State>> = constants.iter().map(|_| None).collect();
        for (tuple, mask) in chunk.bitstring().iter().enumerate() {
            let live = mask.intersect(running);
            if live.is_empty() {
                continue;
            }
            let row = chunk.row(tuple, &inputs)?;
            for query in live {
                let i = position[query.index()];
                let state = match &mut states[i] {
                    Some(state) => state,
                    empty => {
                        let constant = constants[i].1.get::<<D::State as Gla>::Constant>()?;
                        let mut fresh = D::State::init(constant);
                        fresh.pre_chunk();
                        empty.insert(fresh)
                    }
                };
                state.add_item(&row)?;
            }
        }

        Ok(constants
            .iter()
            .zip(states)
            .filter_map(|((query, _), state)| {
                state.map(|mut s| {
                    s.chunk_boundary();
                    (*query, OperatorState::new(s))
                })
            })
            .collect())
    }

    fn merge_states(&self, states: Vec<OperatorState>) -> Result<OperatorState> {
        let typed = states
            .into_iter()
            .map(OperatorState::downcast::<D::State>)
            .collect::<Result<Vec<_>>>()?;
        let merged = typed
            .into_par_iter()
            .reduce_with(|mut a, b| {
                a.add_state(*b);
                a
            })
            .ok_or_else(|| Error::internal("merge called without states"))?;
        Ok(OperatorState::new(*merged))
    }

    fn pre_finalize(
        &self,
        state: Option<OperatorState>,
        constant: &mut ConstantState,
    ) -> Result<(OperatorState, PreFinalize)> {
        let mut state = match state {
            Some(s) => *s.downcast::<D::State>()?,
            None => D::State::init(constant.get::<<D::State as Gla>::Constant>()?),
        };
        let mut iterate = false;
        if GlaDescriptor::iterative(self) {
            constant.update::<<D::State as Gla>::Constant>(|c| iterate = state.should_iterate(c))?;
        }
        let fragments = state.num_fragments().max(1);
        Ok((OperatorState::new(state), PreFinalize { iterate, fragments }))
    }

    fn finalize(&self, query: QueryId, state: &OperatorState, fragment: usize) -> Result<Chunk> {
        let state = state.downcast_ref::<D::State>()?;
        let schema = GlaDescriptor::output_schema(self);
        let mut builder = ChunkBuilder::new(&schema);
        let mask = QueryIdSet::single(query);
        for row in state.finalize(fragment)? {
            builder.push_row(row, mask)?;
        }
        builder.finish()
    }

    fn into_constant(&self, state: OperatorState) -> Result<ConstantState> {
        Ok(ConstantState::new(*state.downcast::<D::State>()?))
    }

    fn post_finalize(&self, query: QueryId) {
        GlaDescriptor::post_finalize(self, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Column;
    use crate::operator::library::{BoundedPasses, Count};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Hooks {
        pre: AtomicUsize,
        boundary: AtomicUsize,
    }

    /// Counts tuples and chunk hooks
    struct Tally {
        hooks: Arc<Hooks>,
        tuples: i64,
    }

    impl Gla for Tally {
        type Constant = Arc<Hooks>;

        fn init(constant: &Arc<Hooks>) -> Self {
            Self {
                hooks: constant.clone(),
                tuples: 0,
            }
        }

        fn pre_chunk(&mut self) {
            self.hooks.pre.fetch_add(1, Ordering::SeqCst);
        }

        fn add_item(&mut self, _row: &[Value]) -> Result<()> {
            self.tuples += 1;
            Ok(())
        }

        fn chunk_boundary(&mut self) {
            self.hooks.boundary.fetch_add(1, Ordering::SeqCst);
        }

        fn add_state(&mut self, other: Self) {
            self.tuples += other.tuples;
        }

        fn finalize(&self, _fragment: usize) -> Result<Vec<Vec<Value>>> {
            Ok(vec![vec![Value::Int64(self.tuples)]])
        }
    }

    struct TallyOp {
        hooks: Arc<Hooks>,
    }

    impl GlaDescriptor for TallyOp {
        type State = Tally;

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

    fn count_of(ops: &dyn GlaOps, query: QueryId, state: &OperatorState) -> i64 {
        let chunk = ops.finalize(query, state, 0).unwrap();
        chunk.row(0, &[0]).unwrap()[0].as_i64().unwrap()
    }

    #[test]
    fn test_process_chunk_splits_by_query() {
        let ops: &dyn GlaOps = &Count;
        let constants = vec![
            (q(0), ops.pre_process(q(0), &ConstantInputs::default()).unwrap()),
            (q(1), ops.pre_process(q(1), &ConstantInputs::default()).unwrap()),
            (q(2), ops.pre_process(q(2), &ConstantInputs::default()).unwrap()),
        ];
        let m0 = QueryIdSet::single(q(0));
        let m01 = m0.union(QueryIdSet::single(q(1)));
        let chunk = Chunk::new(vec![(0, Column::from(vec![1i64, 2, 3]))], vec![m01, m0, m01]).unwrap();

        let states = ops.process_chunk(&chunk, &constants).unwrap();
        // query 2 saw no tuple and gets no partial state
        assert_eq!(states.len(), 2);
        assert_eq!(count_of(ops, q(0), &states[0].1), 3);
        assert_eq!(count_of(ops, q(1), &states[1].1), 2);
    }

    #[test]
    fn test_pre_finalize_without_state_starts_fresh() {
        let ops: &dyn GlaOps = &Count;
        let mut constant = ops.pre_process(q(0), &ConstantInputs::default()).unwrap();
        let (state, decision) = ops.pre_finalize(None, &mut constant).unwrap();
        assert!(!decision.iterate);
        assert_eq!(decision.fragments, 1);
        assert_eq!(count_of(ops, q(0), &state), 0);
    }

    #[test]
    fn test_iterative_pre_finalize_updates_constant() {
        let ops: &dyn GlaOps = &BoundedPasses::new(2);
        let mut constant = ops.pre_process(q(0), &ConstantInputs::default()).unwrap();
        let (_, first) = ops.pre_finalize(None, &mut constant).unwrap();
        assert!(first.iterate);
        let (_, second) = ops.pre_finalize(None, &mut constant).unwrap();
        assert!(!second.iterate);
    }

    #[test]
    fn test_merge_rejects_foreign_state() {
        let ops: &dyn GlaOps = &Count;
        let err = ops.merge_states(vec![OperatorState::new("nope")]).unwrap_err();
        assert!(matches!(err, Error::StateType { .. }));
    }

    #[test]
    fn test_chunk_hooks_bracket_each_chunk() {
        let hooks = Arc::new(Hooks::default());
        let op = TallyOp { hooks: hooks.clone() };
        let ops: &dyn GlaOps = &op;
        let constants = vec![(q(0), ops.pre_process(q(0), &ConstantInputs::default()).unwrap())];
        let mask = QueryIdSet::single(q(0));
        let first = Chunk::uniform(vec![(0, Column::from(vec![1i64, 2, 3]))], mask).unwrap();
        let second = Chunk::uniform(vec![(0, Column::from(vec![4i64]))], mask).unwrap();

        let mut partial: Vec<OperatorState> = Vec::new();
        for chunk in [&first, &second] {
            partial.extend(ops.process_chunk(chunk, &constants).unwrap().into_iter().map(|(_, s)| s));
        }
        assert_eq!(hooks.pre.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.boundary.load(Ordering::SeqCst), 2);

        let merged = ops.merge_states(partial).unwrap();
        assert_eq!(count_of(ops, q(0), &merged), 4);
        // merging is not a chunk
        assert_eq!(hooks.boundary.load(Ordering::SeqCst), 2);
    }
}
