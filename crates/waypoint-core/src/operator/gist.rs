//! Iterative transforms driven in rounds
//!
//! A round starts with [`Gist::prepare_round`], which splits the work into one
//! local task list per worker. Each worker drains its list into its own round
//! accumulator (DoSteps); the accumulators are merged and handed back to
//! [`Gist::should_iterate`].

use super::state::{ConstantInputs, ConstantState, OperatorState};
use crate::chunk::{Chunk, ChunkBuilder, DataType, QueryId, QueryIdSet, SlotId, Value};
use crate::error::{Error, Result};

/// State of an iterative transform for one query
pub trait Gist: Clone + Send + Sync + Sized + 'static {
    /// One unit of work
    type Task: Send + Sync + 'static;
    /// Per-worker accumulator of one round
    type Round: Send + Sync + 'static;

    /// Split the next round into at most `parallelism` local task lists
    fn prepare_round(&mut self, parallelism: usize) -> Vec<Vec<Self::Task>>;

    /// Empty round accumulator
    fn new_round(&self) -> Self::Round;

    /// Execute one task
    fn do_step(&self, task: &Self::Task, round: &mut Self::Round) -> Result<()>;

    /// Fold `other` into `into`
    fn merge_round(&self, into: &mut Self::Round, other: Self::Round);

    /// Absorb the merged round and decide whether to run another
    fn should_iterate(&mut self, round: Self::Round) -> bool;

    /// Output rows once iteration stopped
    fn finalize(&self) -> Result<Vec<Vec<Value>>>;
}

/// Plan-time description of a GIST waypoint
pub trait GistDescriptor: Send + Sync + 'static {
    /// Iterated state
    type State: Gist;

    /// Slots and types of finalized rows
    fn output_schema(&self) -> Vec<(SlotId, DataType)>;

    /// Build a query's state from its upstream constants (PreProcess)
    fn init(&self, query: QueryId, upstream: &ConstantInputs) -> Result<Self::State>;
}

/// Work of one round: a snapshot of the state plus the local task lists
#[derive(Debug)]
pub struct RoundPlan {
    /// Read-only copy of the state every worker steps against
    pub snapshot: ConstantState,
    /// One local scheduler per worker
    pub schedulers: Vec<OperatorState>,
}

/// Object-safe GIST interface the engine drives
pub trait GistOps: Send + Sync {
    /// Output slots and types
    fn output_schema(&self) -> Vec<(SlotId, DataType)>;
    /// Build a query's state
    fn pre_process(&self, query: QueryId, upstream: &ConstantInputs) -> Result<OperatorState>;
    /// Split the next round of `state`
    fn prepare_round(&self, state: &mut OperatorState, parallelism: usize) -> Result<RoundPlan>;
    /// Drain one local scheduler into a round accumulator
    fn do_steps(&self, snapshot: &ConstantState, scheduler: OperatorState) -> Result<OperatorState>;
    /// Merge round accumulators
    fn merge_rounds(&self, snapshot: &ConstantState, rounds: Vec<OperatorState>) -> Result<OperatorState>;
    /// Absorb a merged round; true when another round is needed
    fn should_iterate(&self, state: &mut OperatorState, round: OperatorState) -> Result<bool>;
    /// Finalized rows tagged with the query
    fn finalize(&self, query: QueryId, state: &OperatorState) -> Result<Chunk>;
}

impl<D: GistDescriptor> GistOps for D {
    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        GistDescriptor::output_schema(self)
    }

    fn pre_process(&self, query: QueryId, upstream: &ConstantInputs) -> Result<OperatorState> {
        Ok(OperatorState::new(self.init(query, upstream)?))
    }

    fn prepare_round(&self, state: &mut OperatorState, parallelism: usize) -> Result<RoundPlan> {
        let state = state.downcast_mut::<D::State>()?;
        let mut lists = state.prepare_round(parallelism.max(1));
        // a round always merges at least one accumulator
        if lists.is_empty() {
            lists.push(Vec::new());
        }
        let schedulers = lists.into_iter().map(OperatorState::new).collect();
        Ok(RoundPlan {
            snapshot: ConstantState::new(state.clone()),
            schedulers,
        })
    }

    fn do_steps(&self, snapshot: &ConstantState, scheduler: OperatorState) -> Result<OperatorState> {
        let gist = snapshot.get::<D::State>()?;
        let tasks = scheduler.downcast::<Vec<<D::State as Gist>::Task>>()?;
        let mut round = gist.new_round();
        for task in tasks.iter() {
            gist.do_step(task, &mut round)?;
        }
        Ok(OperatorState::new(round))
    }

    fn merge_rounds(&self, snapshot: &ConstantState, rounds: Vec<OperatorState>) -> Result<OperatorState> {
        let gist = snapshot.get::<D::State>()?;
        let mut rounds = rounds.into_iter();
        let first = rounds
            .next()
            .ok_or_else(|| Error::internal("round merge called without rounds"))?;
        let mut merged = *first.downcast::<<D::State as Gist>::Round>()?;
        for round in rounds {
            gist.merge_round(&mut merged, *round.downcast()?);
        }
        Ok(OperatorState::new(merged))
    }

    fn should_iterate(&self, state: &mut OperatorState, round: OperatorState) -> Result<bool> {
        let round = *round.downcast::<<D::State as Gist>::Round>()?;
        Ok(state.downcast_mut::<D::State>()?.should_iterate(round))
    }

    fn finalize(&self, query: QueryId, state: &OperatorState) -> Result<Chunk> {
        let state = state.downcast_ref::<D::State>()?;
        let mut builder = ChunkBuilder::new(&GistDescriptor::output_schema(self));
        let mask = QueryIdSet::single(query);
        for row in state.finalize()? {
            builder.push_row(row, mask)?;
        }
        builder.finish()
    }
}
