//! Work descriptions, stage results and the stage runners
//!
//! A [`WorkDescription`] is everything a worker needs to run one stage of one
//! waypoint. The runner that interprets it is resolved when the plan is
//! built, so a worker never looks anything up: it calls
//! [`StageRunner::run`] and sends back whatever comes out, together with the
//! [`NextStage`] the result is headed for.

use super::plan::ChunkSource;
use crate::chunk::{Chunk, QueryExit, QueryId, QueryIdSet, WaypointId, compact};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hash::{CleanReport, Cleaner, EvictionAdvice, SegmentedHashTable, SpillStore};
use crate::join::{JoinBuildResult, JoinLhs, JoinRhs};
use crate::operator::{ConstantInputs, ConstantState, GistOps, GlaOps, GtOps, OperatorState, RoundPlan};
use crate::tokens::{TokenKind, WorkToken};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Input of one stage invocation
pub enum WorkDescription {
    /// Read chunk `index` from a scan's source
    ScanRead {
        /// Chunk position in the source
        index: usize,
    },
    /// Drop tuples dead for every query of the waypoint
    Compact {
        /// Input chunk
        chunk: Chunk,
        /// Queries still running through the waypoint
        queries: QueryIdSet,
    },
    /// Build the constant state of every query of a GT, GLA or GIST
    PreProcess {
        /// Upstream constants per query
        upstream: Vec<(QueryId, ConstantInputs)>,
    },
    /// Transform one chunk
    GtChunk {
        /// Input chunk
        chunk: Chunk,
        /// Constant state of each query to run
        constants: Vec<(QueryId, ConstantState)>,
    },
    /// Accumulate one chunk
    GlaChunk {
        /// Input chunk, shared with the replay buffer of iterative aggregates
        chunk: Arc<Chunk>,
        /// Constant state of each query to run
        constants: Vec<(QueryId, ConstantState)>,
    },
    /// Combine partial states of one query
    GlaMerge {
        /// The query
        query: QueryId,
        /// Partial states
        states: Vec<OperatorState>,
    },
    /// Decide between another pass and finalizing one query
    GlaPreFinalize {
        /// The query
        query: QueryId,
        /// Fully merged state; `None` when the query saw no tuple
        state: Option<OperatorState>,
        /// Constant state, updated by iterative operators
        constant: ConstantState,
    },
    /// Produce one fragment of a query's result
    GlaFinalize {
        /// The query
        query: QueryId,
        /// Merged state, shared by all fragments
        state: Arc<OperatorState>,
        /// Fragment number
        fragment: usize,
        /// Round that produced the state
        round: u32,
    },
    /// Cleanup once every fragment of a query is out
    GlaPostFinalize {
        /// The query
        query: QueryId,
    },
    /// Absorb the last round, if any, and plan the next one
    GistNewRound {
        /// The query
        query: QueryId,
        /// Iterated state
        state: OperatorState,
        /// Merged accumulator of the round that just ended
        merged: Option<OperatorState>,
    },
    /// Drain one local scheduler of a GIST round
    GistSteps {
        /// The query
        query: QueryId,
        /// State snapshot of the round
        snapshot: ConstantState,
        /// Local task list
        scheduler: OperatorState,
    },
    /// Combine the round accumulators of one query
    GistMerge {
        /// The query
        query: QueryId,
        /// State snapshot of the round
        snapshot: ConstantState,
        /// One accumulator per local scheduler
        rounds: Vec<OperatorState>,
    },
    /// Emit a GIST query's rows
    GistFinalize {
        /// The query
        query: QueryId,
        /// Converged state
        state: OperatorState,
    },
    /// Insert one chunk into the central table
    JoinRhsChunk {
        /// Build-side chunk
        chunk: Chunk,
        /// Queries the records are written for
        queries: QueryIdSet,
    },
    /// Probe one chunk against the central table
    JoinLhsChunk {
        /// Probe-side chunk
        chunk: Chunk,
    },
    /// Spill the advised owners out of crowded segments
    JoinClean {
        /// Segments and owners to evict
        advice: Vec<EvictionAdvice>,
    },
    /// Drop a finished join's records
    JoinPurge,
}

impl WorkDescription {
    /// Stage this work belongs to
    pub fn tag(&self) -> StageTag {
        match self {
            WorkDescription::ScanRead { .. } => StageTag::Scan,
            WorkDescription::Compact { .. } => StageTag::Compact,
            WorkDescription::PreProcess { .. } => StageTag::PreProcess,
            WorkDescription::GtChunk { .. } => StageTag::Transform,
            WorkDescription::GlaChunk { .. } => StageTag::Accumulate,
            WorkDescription::GlaMerge { .. } => StageTag::Merge,
            WorkDescription::GlaPreFinalize { .. } => StageTag::PreFinalize,
            WorkDescription::GlaFinalize { .. } => StageTag::Finalize,
            WorkDescription::GlaPostFinalize { .. } => StageTag::PostFinalize,
            WorkDescription::GistNewRound { .. } => StageTag::NewRound,
            WorkDescription::GistSteps { .. } => StageTag::DoSteps,
            WorkDescription::GistMerge { .. } => StageTag::MergeRounds,
            WorkDescription::GistFinalize { .. } => StageTag::GistFinalize,
            WorkDescription::JoinRhsChunk { .. } => StageTag::JoinBuild,
            WorkDescription::JoinLhsChunk { .. } => StageTag::JoinProbe,
            WorkDescription::JoinClean { .. } => StageTag::JoinClean,
            WorkDescription::JoinPurge => StageTag::JoinPurge,
        }
    }

    /// Token class the work runs under
    pub(crate) fn token_class(&self) -> TokenClass {
        match self {
            WorkDescription::ScanRead { .. } => TokenClass::Disk,
            WorkDescription::JoinClean { .. } | WorkDescription::JoinPurge => TokenClass::CleanerCpu,
            _ => TokenClass::Cpu,
        }
    }
}

impl fmt::Debug for WorkDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkDescription").field(&self.tag()).finish()
    }
}

/// Token pool a piece of work draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum TokenClass {
    Cpu,
    Disk,
    CleanerCpu,
}

impl TokenClass {
    pub(crate) const ALL: [TokenClass; 3] = [TokenClass::Cpu, TokenClass::Disk, TokenClass::CleanerCpu];
}

/// Which stage ran; keys the per-stage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTag {
    /// Chunk read from a source
    Scan,
    /// Chunk compacted
    Compact,
    /// Constant states built
    PreProcess,
    /// Chunk transformed
    Transform,
    /// Chunk accumulated into partial states
    Accumulate,
    /// Partial states merged
    Merge,
    /// Iterate-or-finalize decided
    PreFinalize,
    /// Fragment finalized
    Finalize,
    /// Query cleanup after finalize
    PostFinalize,
    /// GIST round planned
    NewRound,
    /// GIST local scheduler drained
    DoSteps,
    /// GIST round accumulators merged
    MergeRounds,
    /// GIST rows emitted
    GistFinalize,
    /// Join records written
    JoinBuild,
    /// Join chunk probed
    JoinProbe,
    /// Join records spilled by the cleaner
    JoinClean,
    /// Join records purged
    JoinPurge,
}

/// Where a stage result goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStage {
    /// Chunk processing: route chunks downstream, or start accepting chunks
    Process,
    /// Partial states waiting to be merged
    Merge,
    /// Merged state waiting for PreFinalize
    PreFinalize,
    /// Fragments to finalize
    Finalize,
    /// Query ready for its cleanup hook
    PostFinalize,
    /// GIST state waiting for its next round
    NewRound,
    /// GIST round planned; local schedulers to drain
    DoSteps,
    /// GIST accumulators waiting to be merged
    MergeRounds,
    /// Nothing left for this result
    Done,
}

/// A query's merged aggregate after PreFinalize
#[derive(Debug)]
pub enum Settled {
    /// State to finalize into rows
    Rows {
        /// The state
        state: OperatorState,
        /// Fragments to finalize
        fragments: usize,
    },
    /// State handed downstream as a constant
    Constant(ConstantState),
}

/// Output of one stage invocation
#[derive(Debug)]
pub enum ExecEngineData {
    /// A chunk flowing downstream
    Chunk(Chunk),
    /// Constant states built by PreProcess
    Constants(Vec<(QueryId, ConstantState)>),
    /// Partial aggregate states, one per query that saw tuples
    States(Vec<(QueryId, OperatorState)>),
    /// A single state of one query (merged aggregate or GIST round)
    State {
        /// The query
        query: QueryId,
        /// The state
        state: OperatorState,
    },
    /// Outcome of PreFinalize
    PreFinalized {
        /// The query
        query: QueryId,
        /// Constant state the next pass starts from
        constant: ConstantState,
        /// The merged state
        settled: Settled,
    },
    /// A GIST state back from NewRound; no plan once it converged
    GistRound {
        /// The query
        query: QueryId,
        /// Iterated state
        state: OperatorState,
        /// Work of the next round
        plan: Option<RoundPlan>,
    },
    /// Rows of a finalized query; the chunk may be empty
    Finalized {
        /// The query
        query: QueryId,
        /// Output rows tagged with the query
        chunk: Chunk,
    },
    /// Insert statistics from the build side of a join
    JoinBuilt(JoinBuildResult),
    /// A query's cleanup hook ran
    PostFinalized(QueryId),
    /// Outcome of a cleaner pass
    Cleaned(CleanReport),
    /// Number of records purged
    Purged(usize),
}

/// A unit of work handed to the pool
pub struct WorkAssignment {
    /// Waypoint the work belongs to
    pub waypoint: WaypointId,
    /// Interpreter of the payload
    pub runner: Arc<dyn StageRunner>,
    /// Permit the work runs under; travels back with the completion
    pub token: WorkToken,
    /// Queries whose results leave the plan at this waypoint
    pub query_exits: Vec<QueryExit>,
    /// The work itself
    pub payload: WorkDescription,
}

/// Result of a unit of work
pub struct Completion {
    /// Waypoint the work belonged to
    pub waypoint: WaypointId,
    /// Worker thread that ran it
    pub worker_id: usize,
    /// Wall time spent in the stage
    pub elapsed: Duration,
    /// Permit to release
    pub token: WorkToken,
    /// Exits forwarded from the assignment
    pub query_exits: Vec<QueryExit>,
    /// Stage that ran
    pub stage: StageTag,
    /// Stage output and where it goes next
    pub result: Result<(ExecEngineData, NextStage)>,
}

/// Shared resources a stage may touch
pub struct StageContext<'a> {
    /// Worker running the stage
    pub worker_id: usize,
    /// Central join table
    pub table: &'a SegmentedHashTable,
    /// Table cleaner
    pub cleaner: &'a Cleaner,
    /// Records the cleaner spilled
    pub spill: &'a SpillStore,
    /// Engine configuration
    pub config: &'a EngineConfig,
    /// Token the work runs under
    pub token: &'a WorkToken,
}

/// Stage function of one waypoint kind
pub trait StageRunner: Send + Sync {
    /// Run one piece of work
    fn run(&self, work: WorkDescription, ctx: &StageContext<'_>) -> Result<(ExecEngineData, NextStage)>;
}

fn unexpected(runner: &str, work: &WorkDescription) -> Error {
    Error::dispatch(format!("{runner} runner cannot execute {:?} work", work.tag()))
}

/// Run PreProcess for every query, naming the waypoint and query on failure
fn pre_process<T>(
    name: &str,
    upstream: Vec<(QueryId, ConstantInputs)>,
    build: impl Fn(QueryId, &ConstantInputs) -> Result<T>,
) -> Result<Vec<(QueryId, T)>> {
    upstream
        .into_iter()
        .map(|(query, inputs)| {
            build(query, &inputs)
                .map(|state| (query, state))
                .map_err(|e| Error::plan(name, Some(query), format!("pre-process failed: {e}")))
        })
        .collect()
}

pub(crate) struct ScanRunner {
    pub(crate) source: Arc<dyn ChunkSource>,
    pub(crate) queries: QueryIdSet,
    pub(crate) name: String,
}

impl StageRunner for ScanRunner {
    fn run(&self, work: WorkDescription, ctx: &StageContext<'_>) -> Result<(ExecEngineData, NextStage)> {
        let WorkDescription::ScanRead { index } = work else {
            return Err(unexpected("scan", &work));
        };
        if ctx.token.kind() != TokenKind::Disk {
            return Err(Error::dispatch("scan reads need a disk token"));
        }
        let chunk = self.source.read_chunk(index)?;
        let stray = chunk.queries().difference(self.queries);
        if !stray.is_empty() {
            return Err(Error::plan(
                self.name.clone(),
                stray.first(),
                format!("chunk {index} carries queries {stray:?} not routed through the scan"),
            ));
        }
        Ok((ExecEngineData::Chunk(chunk.with_sequence(index as u64)), NextStage::Process))
    }
}

pub(crate) struct CompactRunner;

impl StageRunner for CompactRunner {
    fn run(&self, work: WorkDescription, _ctx: &StageContext<'_>) -> Result<(ExecEngineData, NextStage)> {
        let WorkDescription::Compact { chunk, queries } = work else {
            return Err(unexpected("compact", &work));
        };
        Ok((ExecEngineData::Chunk(compact(chunk, queries)?), NextStage::Process))
    }
}

pub(crate) struct GtRunner {
    pub(crate) op: Arc<dyn GtOps>,
    pub(crate) name: String,
}

impl StageRunner for GtRunner {
    fn run(&self, work: WorkDescription, _ctx: &StageContext<'_>) -> Result<(ExecEngineData, NextStage)> {
        match work {
            WorkDescription::PreProcess { upstream } => {
                let constants = pre_process(&self.name, upstream, |q, inputs| self.op.pre_process(q, inputs))?;
                Ok((ExecEngineData::Constants(constants), NextStage::Process))
            }
            WorkDescription::GtChunk { chunk, constants } => {
                let out = self.op.process_chunk(&chunk, &constants)?;
                Ok((ExecEngineData::Chunk(out), NextStage::Process))
            }
            other => Err(unexpected("transform", &other)),
        }
    }
}

pub(crate) struct GlaRunner {
    pub(crate) op: Arc<dyn GlaOps>,
    pub(crate) name: String,
}

impl StageRunner for GlaRunner {
    fn run(&self, work: WorkDescription, _ctx: &StageContext<'_>) -> Result<(ExecEngineData, NextStage)> {
        match work {
            WorkDescription::PreProcess { upstream } => {
                let constants = pre_process(&self.name, upstream, |q, inputs| self.op.pre_process(q, inputs))?;
                Ok((ExecEngineData::Constants(constants), NextStage::Process))
            }
            WorkDescription::GlaChunk { chunk, constants } => {
                let states = self.op.process_chunk(&chunk, &constants)?;
                Ok((ExecEngineData::States(states), NextStage::Merge))
            }
            WorkDescription::GlaMerge { query, states } => {
                let state = self.op.merge_states(states)?;
                Ok((ExecEngineData::State { query, state }, NextStage::PreFinalize))
            }
            WorkDescription::GlaPreFinalize {
                query,
                state,
                mut constant,
            } => {
                let (state, decision) = self.op.pre_finalize(state, &mut constant)?;
                let fragments = decision.fragments;
                let (settled, next) = if decision.iterate {
                    (Settled::Rows { state, fragments }, NextStage::Process)
                } else if self.op.finalize_as_state() {
                    (Settled::Constant(self.op.into_constant(state)?), NextStage::PostFinalize)
                } else {
                    (Settled::Rows { state, fragments }, NextStage::Finalize)
                };
                Ok((
                    ExecEngineData::PreFinalized {
                        query,
                        constant,
                        settled,
                    },
                    next,
                ))
            }
            WorkDescription::GlaFinalize {
                query,
                state,
                fragment,
                round,
            } => {
                let sequence = (u64::from(round) << 32) | fragment as u64;
                let chunk = self.op.finalize(query, &state, fragment)?.with_sequence(sequence);
                Ok((ExecEngineData::Finalized { query, chunk }, NextStage::PostFinalize))
            }
            WorkDescription::GlaPostFinalize { query } => {
                self.op.post_finalize(query);
                Ok((ExecEngineData::PostFinalized(query), NextStage::Done))
            }
            other => Err(unexpected("aggregate", &other)),
        }
    }
}

pub(crate) struct GistRunner {
    pub(crate) op: Arc<dyn GistOps>,
    pub(crate) name: String,
}

impl StageRunner for GistRunner {
    fn run(&self, work: WorkDescription, ctx: &StageContext<'_>) -> Result<(ExecEngineData, NextStage)> {
        match work {
            WorkDescription::PreProcess { upstream } => {
                let states = pre_process(&self.name, upstream, |q, inputs| self.op.pre_process(q, inputs))?;
                Ok((ExecEngineData::States(states), NextStage::NewRound))
            }
            WorkDescription::GistNewRound {
                query,
                mut state,
                merged,
            } => {
                let iterate = match merged {
                    Some(round) => self.op.should_iterate(&mut state, round)?,
                    None => true,
                };
                if !iterate {
                    return Ok((ExecEngineData::GistRound { query, state, plan: None }, NextStage::Finalize));
                }
                let scheduler = &ctx.config.scheduler;
                let parallelism = scheduler.worker_threads * scheduler.gist_tasks_per_worker.max(1);
                let plan = self.op.prepare_round(&mut state, parallelism)?;
                Ok((
                    ExecEngineData::GistRound {
                        query,
                        state,
                        plan: Some(plan),
                    },
                    NextStage::DoSteps,
                ))
            }
            WorkDescription::GistSteps {
                query,
                snapshot,
                scheduler,
            } => {
                let state = self.op.do_steps(&snapshot, scheduler)?;
                Ok((ExecEngineData::State { query, state }, NextStage::MergeRounds))
            }
            WorkDescription::GistMerge {
                query,
                snapshot,
                rounds,
            } => {
                let state = self.op.merge_rounds(&snapshot, rounds)?;
                Ok((ExecEngineData::State { query, state }, NextStage::NewRound))
            }
            WorkDescription::GistFinalize { query, state } => {
                let chunk = self.op.finalize(query, &state)?;
                Ok((ExecEngineData::Finalized { query, chunk }, NextStage::Done))
            }
            other => Err(unexpected("gist", &other)),
        }
    }
}

pub(crate) struct JoinRhsRunner {
    pub(crate) rhs: Arc<JoinRhs>,
}

impl StageRunner for JoinRhsRunner {
    fn run(&self, work: WorkDescription, ctx: &StageContext<'_>) -> Result<(ExecEngineData, NextStage)> {
        match work {
            WorkDescription::JoinRhsChunk { chunk, queries } => {
                let built = self.rhs.insert_chunk(
                    ctx.table,
                    &chunk,
                    queries,
                    ctx.config.table.test_probes,
                    ctx.config.table.max_fill_rate,
                    &mut rand::thread_rng(),
                )?;
                Ok((ExecEngineData::JoinBuilt(built), NextStage::Process))
            }
            WorkDescription::JoinClean { advice } => {
                ctx.cleaner.hoard_disk_tokens();
                let mut sink = ctx.spill;
                let report = ctx.cleaner.clean(ctx.table, &advice, &mut sink, ctx.token);
                ctx.cleaner.release_hoard();
                Ok((ExecEngineData::Cleaned(report?), NextStage::Process))
            }
            WorkDescription::JoinPurge => {
                let waypoint = self.rhs.waypoint();
                let purged = ctx.cleaner.purge_waypoint(ctx.table, waypoint, ctx.token)? + ctx.spill.remove(waypoint);
                Ok((ExecEngineData::Purged(purged), NextStage::Done))
            }
            other => Err(unexpected("join build", &other)),
        }
    }
}

pub(crate) struct JoinLhsRunner {
    pub(crate) lhs: Arc<JoinLhs>,
}

impl StageRunner for JoinLhsRunner {
    fn run(&self, work: WorkDescription, ctx: &StageContext<'_>) -> Result<(ExecEngineData, NextStage)> {
        let WorkDescription::JoinLhsChunk { chunk } = work else {
            return Err(unexpected("join probe", &work));
        };
        let view = ctx.table.enter_reader();
        let spilled = ctx.spill.records(self.lhs.rhs());
        let out = self.lhs.probe_chunk(&view, spilled.as_deref(), chunk)?;
        Ok((ExecEngineData::Chunk(out), NextStage::Process))
    }
}
