//! The coordinator loop
//!
//! One thread (the caller of [`ExecutionEngine::run`]) owns every piece of
//! per-run bookkeeping. It queues work per token class, grabs tokens without
//! blocking, hands work to the pool and then blocks on the completion
//! channel. Routing a completion may unlock more work: downstream chunks,
//! merges, the next round of an iterative operator, or a waypoint whose
//! constant inputs just finished.

use super::plan::{Plan, WaypointKind};
use super::results::{ExitCollector, QueryResults, RunStats};
use super::work::{
    Completion, ExecEngineData, NextStage, Settled, StageTag, TokenClass, WorkAssignment, WorkDescription,
};
use super::worker::{SharedResources, WorkerPool};
use crate::chunk::{Chunk, QueryId, QueryIdSet, WaypointId};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hash::{Cleaner, EvictionAdvice, SegmentGeometry, SegmentedHashTable, SpillStore};
use crate::join::JoinBuildResult;
use crate::operator::{ConstantInputs, ConstantState, GlaOps, OperatorState, RoundPlan};
use crate::tokens::{Priority, TokenKind, TokenPool};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs plans on a fixed worker pool.
///
/// The engine owns the token pools, the central join table, the table
/// cleaner and its spill store; all of them outlive individual runs.
pub struct ExecutionEngine {
    config: Arc<EngineConfig>,
    tokens: TokenPool,
    table: Arc<SegmentedHashTable>,
    cleaner: Arc<Cleaner>,
    spill: Arc<SpillStore>,
    workers: WorkerPool,
}

impl ExecutionEngine {
    /// Validate `config` and start the worker threads
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tokens = TokenPool::new(&config.tokens)?;
        let table = Arc::new(SegmentedHashTable::new(SegmentGeometry::from_config(&config.table)?));
        let cleaner = Arc::new(Cleaner::new(
            config.table.clean_fill_rate,
            tokens.clone(),
            config.tokens.cleaner_disk_tokens,
        ));
        let spill = Arc::new(SpillStore::new());
        let t = &config.tokens;
        let capacity = t.cpu_tokens + t.disk_tokens + t.cleaner_cpu_tokens + t.cleaner_disk_tokens;
        let threads = config.scheduler.worker_threads;
        let config = Arc::new(config);
        let workers = WorkerPool::new(
            threads,
            capacity,
            Arc::new(SharedResources {
                table: table.clone(),
                cleaner: cleaner.clone(),
                spill: spill.clone(),
                config: config.clone(),
            }),
        )?;
        info!(
            threads,
            cpu_tokens = config.tokens.cpu_tokens,
            disk_tokens = config.tokens.disk_tokens,
            segments = config.table.num_segments,
            "execution engine started"
        );
        Ok(Self {
            config,
            tokens,
            table,
            cleaner,
            spill,
            workers,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token pools shared by every run
    pub fn tokens(&self) -> &TokenPool {
        &self.tokens
    }

    /// Central join table
    pub fn table(&self) -> &SegmentedHashTable {
        &self.table
    }

    /// Join records the cleaner moved out of the table
    pub fn spill(&self) -> &SpillStore {
        &self.spill
    }

    /// Execute `plan` to completion.
    ///
    /// Stops at the first stage error, waits for work already handed to the
    /// pool, drops the join records the plan wrote, and returns the error.
    pub fn run(&mut self, plan: &Plan) -> Result<QueryResults> {
        let started = Instant::now();
        let mut coordinator = Coordinator::new(self, plan);
        if let Err(err) = coordinator.drive() {
            coordinator.drain();
            drop(coordinator);
            self.purge_joins(plan);
            return Err(err);
        }

        let Coordinator { exits, mut stats, .. } = coordinator;
        stats.elapsed = started.elapsed();
        info!(
            queries = plan.exits().len(),
            chunks = stats.chunks_scanned,
            invocations = stats.invocations(),
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "run finished"
        );
        Ok(QueryResults {
            outputs: exits.finish(),
            stats,
        })
    }

    /// Drop every build side's records after a failed run. Waypoint ids are
    /// positional, so leftovers would match the probes of the next plan.
    fn purge_joins(&self, plan: &Plan) {
        for waypoint in plan.waypoints() {
            let WaypointKind::JoinRhs(rhs) = waypoint.kind() else {
                continue;
            };
            let owner = rhs.waypoint();
            let purged = self
                .cleaner
                .acquire_cpu()
                .and_then(|cpu| self.cleaner.purge_waypoint(&self.table, owner, &cpu))
                .map(|n| n + self.spill.remove(owner));
            match purged {
                Ok(0) => {}
                Ok(n) => warn!(waypoint = %waypoint.name(), purged = n, "dropped join records of failed run"),
                Err(e) => warn!(waypoint = %waypoint.name(), error = %e, "failed to drop join records"),
            }
        }
    }

    /// Stop the worker threads
    pub fn shutdown(mut self) -> Result<()> {
        self.workers.shutdown()
    }
}

struct Queued {
    priority: Priority,
    ticket: u64,
    waypoint: WaypointId,
    work: WorkDescription,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // max-heap: lowest priority value, then oldest ticket, pops first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.ticket.cmp(&self.ticket))
    }
}

struct GlaRun {
    op: Arc<dyn GlaOps>,
    round: u32,
    active: QueryIdSet,
    next_active: QueryIdSet,
    replay: Vec<Arc<Chunk>>,
    partial: BTreeMap<QueryId, Vec<OperatorState>>,
    merging: BTreeMap<QueryId, usize>,
    settling: QueryIdSet,
    closing: BTreeMap<QueryId, (u32, usize)>,
    chunks_in_flight: usize,
}

/// A GIST query's state lives here between stages and travels with its
/// NewRound work otherwise
#[derive(Default)]
struct GistQuery {
    state: Option<OperatorState>,
    snapshot: Option<ConstantState>,
    steps_left: usize,
    rounds: Vec<OperatorState>,
    round: u32,
    converged: bool,
}

#[derive(Default)]
struct GistRun {
    queries: BTreeMap<QueryId, GistQuery>,
}

enum NodeOp {
    Scan { next: usize, total: usize, reading: usize },
    Stream,
    Gla(GlaRun),
    Gist(GistRun),
}

struct Node {
    in_flight: usize,
    input_done: bool,
    preparing: bool,
    ready: bool,
    done: bool,
    waiting: Vec<Chunk>,
    constants: Vec<(QueryId, ConstantState)>,
    op: NodeOp,
}

struct Coordinator<'a> {
    tokens: &'a TokenPool,
    workers: &'a WorkerPool,
    cleaner: &'a Cleaner,
    config: &'a EngineConfig,
    plan: &'a Plan,
    nodes: Vec<Node>,
    queues: [BinaryHeap<Queued>; 3],
    ticket: u64,
    queued: usize,
    submitted: usize,
    finalized: BTreeMap<(WaypointId, QueryId), ConstantState>,
    probes_left: BTreeMap<WaypointId, usize>,
    exits: ExitCollector,
    stats: RunStats,
}

fn class_index(class: TokenClass) -> usize {
    match class {
        TokenClass::Cpu => 0,
        TokenClass::Disk => 1,
        TokenClass::CleanerCpu => 2,
    }
}

impl<'a> Coordinator<'a> {
    fn new(engine: &'a ExecutionEngine, plan: &'a Plan) -> Self {
        let mut probes_left = BTreeMap::new();
        let nodes = plan
            .waypoints()
            .iter()
            .map(|w| {
                let op = match w.kind() {
                    WaypointKind::Scan(source) => NodeOp::Scan {
                        next: 0,
                        total: source.num_chunks(),
                        reading: 0,
                    },
                    WaypointKind::Gla(op) => NodeOp::Gla(GlaRun {
                        op: op.clone(),
                        round: 0,
                        active: QueryIdSet::EMPTY,
                        next_active: QueryIdSet::EMPTY,
                        replay: Vec::new(),
                        partial: BTreeMap::new(),
                        merging: BTreeMap::new(),
                        settling: QueryIdSet::EMPTY,
                        closing: BTreeMap::new(),
                        chunks_in_flight: 0,
                    }),
                    WaypointKind::Gist(_) => NodeOp::Gist(GistRun::default()),
                    WaypointKind::JoinLhs(lhs) => {
                        *probes_left.entry(lhs.rhs()).or_insert(0) += 1;
                        NodeOp::Stream
                    }
                    _ => NodeOp::Stream,
                };
                Node {
                    in_flight: 0,
                    input_done: w.input.is_none(),
                    preparing: false,
                    ready: false,
                    done: false,
                    waiting: Vec::new(),
                    constants: Vec::new(),
                    op,
                }
            })
            .collect();

        let mut exits = ExitCollector::default();
        for exit in plan.exits() {
            exits.register(exit.query, Vec::new());
        }

        Self {
            tokens: &engine.tokens,
            workers: &engine.workers,
            cleaner: &engine.cleaner,
            config: &engine.config,
            plan,
            nodes,
            queues: [BinaryHeap::new(), BinaryHeap::new(), BinaryHeap::new()],
            ticket: 0,
            queued: 0,
            submitted: 0,
            finalized: BTreeMap::new(),
            probes_left,
            exits,
            stats: RunStats::default(),
        }
    }

    fn name(&self, w: WaypointId) -> String {
        self.plan.waypoint(w).name().to_string()
    }

    fn drive(&mut self) -> Result<()> {
        for i in 0..self.nodes.len() {
            self.try_ready(WaypointId(i as u32))?;
        }
        loop {
            self.dispatch_queued()?;
            if self.queued + self.submitted == 0 {
                break;
            }
            if self.submitted == 0 {
                return Err(Error::dispatch(format!(
                    "{} work items queued but no token can be granted",
                    self.queued
                )));
            }
            let completion = self.workers.recv()?;
            self.submitted -= 1;
            self.complete(completion)?;
        }

        let stuck: Vec<String> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.done)
            .map(|(i, _)| self.name(WaypointId(i as u32)))
            .collect();
        if let Some(first) = stuck.first() {
            return Err(Error::plan(
                first.clone(),
                None,
                format!("run stalled with unfinished waypoints: {}", stuck.join(", ")),
            ));
        }
        Ok(())
    }

    /// Collect completions of work already handed out
    fn drain(&mut self) {
        while self.submitted > 0 {
            if self.workers.recv().is_err() {
                break;
            }
            self.submitted -= 1;
        }
    }

    fn enqueue(&mut self, waypoint: WaypointId, work: WorkDescription) {
        let priority = self.plan.waypoint(waypoint).priority;
        let class = work.token_class();
        self.ticket += 1;
        self.queued += 1;
        self.nodes[waypoint.0 as usize].in_flight += 1;
        self.queues[class_index(class)].push(Queued {
            priority,
            ticket: self.ticket,
            waypoint,
            work,
        });
    }

    fn dispatch_queued(&mut self) -> Result<()> {
        for class in TokenClass::ALL {
            let queue = class_index(class);
            while let Some(top) = self.queues[queue].peek() {
                let token = match class {
                    TokenClass::Cpu => self.tokens.try_acquire(TokenKind::Cpu, top.priority),
                    TokenClass::Disk => self.tokens.try_acquire(TokenKind::Disk, top.priority),
                    TokenClass::CleanerCpu => self.tokens.try_acquire_cleaner(TokenKind::Cpu),
                };
                let Some(token) = token else { break };
                let Some(item) = self.queues[queue].pop() else { break };
                let waypoint = self.plan.waypoint(item.waypoint);
                self.workers.submit(WorkAssignment {
                    waypoint: item.waypoint,
                    runner: waypoint.runner.clone(),
                    token,
                    query_exits: waypoint.query_exits(),
                    payload: item.work,
                })?;
                self.queued -= 1;
                self.submitted += 1;
            }
        }
        Ok(())
    }

    fn complete(&mut self, completion: Completion) -> Result<()> {
        let Completion {
            waypoint,
            worker_id,
            elapsed,
            token,
            query_exits,
            stage,
            result,
        } = completion;
        drop(token);
        self.nodes[waypoint.0 as usize].in_flight -= 1;
        let (data, next) = result?;
        self.stats.record(stage, elapsed);
        debug!(%waypoint, worker_id, ?stage, ?next, exits = query_exits.len(), "stage complete");

        match (next, data) {
            (NextStage::Process, ExecEngineData::Chunk(chunk)) => {
                let scanned = stage == StageTag::Scan;
                if scanned {
                    self.scan_completed(waypoint, elapsed);
                }
                self.emit(waypoint, chunk)?;
                if scanned {
                    self.fill_scan(waypoint);
                }
            }
            (NextStage::Process, ExecEngineData::Constants(constants)) => self.preprocessed(waypoint, constants)?,
            (NextStage::Process, ExecEngineData::JoinBuilt(built)) => self.join_built(waypoint, built),
            (NextStage::Process, ExecEngineData::Cleaned(report)) => {
                self.stats.cleaner_passes += 1;
                self.stats.records_spilled += report.evicted as u64;
            }
            (NextStage::Merge, ExecEngineData::States(states)) => self.states_arrived(waypoint, states),
            (NextStage::PreFinalize, ExecEngineData::State { query, state }) => {
                if let NodeOp::Gla(run) = &mut self.nodes[waypoint.0 as usize].op {
                    if let Some(n) = run.merging.get_mut(&query) {
                        *n -= 1;
                    }
                    run.partial.entry(query).or_default().push(state);
                }
                self.eager_merge(waypoint, query);
            }
            (
                next,
                ExecEngineData::PreFinalized {
                    query,
                    constant,
                    settled,
                },
            ) => self.pre_finalized(waypoint, next, query, constant, settled)?,
            (NextStage::PostFinalize, ExecEngineData::Finalized { query, chunk }) => {
                let round = (chunk.sequence() >> 32) as u32;
                self.emit(waypoint, chunk)?;
                self.fragment_done(waypoint, query, round);
            }
            (NextStage::Done, ExecEngineData::PostFinalized(query)) => {
                debug!(%waypoint, %query, "aggregate finalized");
            }
            (NextStage::NewRound, ExecEngineData::States(states)) => self.gist_preprocessed(waypoint, states)?,
            (
                NextStage::DoSteps,
                ExecEngineData::GistRound {
                    query,
                    state,
                    plan: Some(plan),
                },
            ) => self.round_planned(waypoint, query, state, plan)?,
            (NextStage::Finalize, ExecEngineData::GistRound { query, state, plan: None }) => {
                self.converged(waypoint, query, state)?
            }
            (NextStage::MergeRounds, ExecEngineData::State { query, state }) => self.steps_done(waypoint, query, state)?,
            (NextStage::NewRound, ExecEngineData::State { query, state }) => {
                self.round_merged(waypoint, query, state)?
            }
            (NextStage::Done, ExecEngineData::Finalized { query, chunk }) => {
                debug!(%waypoint, %query, rows = chunk.num_tuples(), "gist finalized");
                self.emit(waypoint, chunk)?;
            }
            (NextStage::Done, ExecEngineData::Purged(n)) => self.stats.records_purged += n as u64,
            (next, data) => {
                return Err(Error::internal(format!(
                    "unexpected {data:?} headed for {next:?} from {}",
                    self.name(waypoint)
                )));
            }
        }
        self.progress(waypoint)
    }

    fn scan_completed(&mut self, waypoint: WaypointId, elapsed: Duration) {
        self.stats.chunks_scanned += 1;
        if let NodeOp::Scan { reading, .. } = &mut self.nodes[waypoint.0 as usize].op {
            *reading -= 1;
        }
        let interval = self.config.scan.disk_statistics_interval as u64;
        if interval > 0 && self.stats.chunks_scanned % interval == 0 {
            let disk = self.tokens.stats(TokenKind::Disk);
            let total = self.stats.stage_time.get(&StageTag::Scan).copied().unwrap_or_default();
            info!(
                chunks = self.stats.chunks_scanned,
                mean_read_us = (total.as_micros() as u64) / self.stats.chunks_scanned,
                last_read_us = elapsed.as_micros() as u64,
                disk_outstanding = disk.outstanding,
                disk_issued = disk.issued,
                "disk statistics"
            );
        }
    }

    fn fill_scan(&mut self, waypoint: WaypointId) {
        let max = self.config.scan.max_chunk_requests.max(1);
        let mut reads = Vec::new();
        if let NodeOp::Scan { next, total, reading } = &mut self.nodes[waypoint.0 as usize].op {
            while *reading < max && *next < *total {
                reads.push(*next);
                *next += 1;
                *reading += 1;
            }
        }
        for index in reads {
            self.enqueue(waypoint, WorkDescription::ScanRead { index });
        }
    }

    /// Send a produced chunk to the exits it serves and to every consumer
    fn emit(&mut self, from: WaypointId, chunk: Chunk) -> Result<()> {
        let live = chunk.queries();
        if chunk.is_empty() || live.is_empty() {
            return Ok(());
        }
        let plan = self.plan;
        let waypoint = plan.waypoint(from);
        for query in waypoint.exits.intersect(live) {
            self.exits.collect(query, &chunk)?;
        }
        let consumers: Vec<WaypointId> = waypoint
            .consumers
            .iter()
            .copied()
            .filter(|c| plan.waypoint(*c).queries().overlaps(live))
            .collect();
        for consumer in consumers {
            self.deliver(consumer, chunk.clone())?;
        }
        Ok(())
    }

    fn deliver(&mut self, to: WaypointId, chunk: Chunk) -> Result<()> {
        let idx = to.0 as usize;
        if !self.nodes[idx].ready {
            self.nodes[idx].waiting.push(chunk);
            return Ok(());
        }
        let plan = self.plan;
        let waypoint = plan.waypoint(to);
        let live = chunk.queries();
        let work = match waypoint.kind() {
            WaypointKind::Compact => WorkDescription::Compact {
                chunk,
                queries: waypoint.queries(),
            },
            WaypointKind::Gt(_) => {
                let constants = constants_for(&self.nodes[idx].constants, live);
                if constants.is_empty() {
                    return Ok(());
                }
                WorkDescription::GtChunk { chunk, constants }
            }
            WaypointKind::Gla(_) => {
                let node = &mut self.nodes[idx];
                let NodeOp::Gla(run) = &mut node.op else {
                    return Err(Error::internal("aggregate waypoint without aggregate state"));
                };
                let chunk = Arc::new(chunk);
                if run.op.iterative() {
                    run.replay.push(chunk.clone());
                }
                let constants = constants_for(&node.constants, live.intersect(run.active));
                if constants.is_empty() {
                    return Ok(());
                }
                run.chunks_in_flight += 1;
                WorkDescription::GlaChunk { chunk, constants }
            }
            WaypointKind::JoinRhs(_) => WorkDescription::JoinRhsChunk {
                chunk,
                queries: waypoint.queries(),
            },
            WaypointKind::JoinLhs(_) => WorkDescription::JoinLhsChunk { chunk },
            WaypointKind::Scan(_) | WaypointKind::Gist(_) => {
                return Err(Error::plan(waypoint.name(), None, "source waypoint received a chunk"));
            }
        };
        self.enqueue(to, work);
        Ok(())
    }

    /// Resolve constant inputs and join gating. Operators then run
    /// PreProcess on the pool; every other waypoint is ready at once.
    fn try_ready(&mut self, w: WaypointId) -> Result<()> {
        let idx = w.0 as usize;
        if self.nodes[idx].ready || self.nodes[idx].preparing {
            return Ok(());
        }
        let plan = self.plan;
        let waypoint = plan.waypoint(w);
        if waypoint
            .constant_inputs
            .iter()
            .any(|c| !self.nodes[c.0 as usize].done)
        {
            return Ok(());
        }
        if let WaypointKind::JoinLhs(lhs) = waypoint.kind() {
            if !self.nodes[lhs.rhs().0 as usize].done {
                return Ok(());
            }
        }
        if !matches!(
            waypoint.kind(),
            WaypointKind::Gt(_) | WaypointKind::Gla(_) | WaypointKind::Gist(_)
        ) {
            self.become_ready(w)?;
            return self.progress(w);
        }

        let mut upstream = Vec::new();
        for query in waypoint.queries() {
            let mut states = Vec::with_capacity(waypoint.constant_inputs.len());
            for c in &waypoint.constant_inputs {
                let state = self.finalized.get(&(*c, query)).cloned().ok_or_else(|| {
                    Error::plan(
                        waypoint.name(),
                        Some(query),
                        format!("constant input {} finished without a state", self.name(*c)),
                    )
                })?;
                states.push(state);
            }
            upstream.push((query, ConstantInputs::new(states)));
        }
        debug!(waypoint = %waypoint.name(), queries = ?waypoint.queries(), "pre-processing");
        self.nodes[idx].preparing = true;
        self.enqueue(w, WorkDescription::PreProcess { upstream });
        Ok(())
    }

    /// Start accepting input: scans start reading, GISTs start their first
    /// round, everything else takes the chunks that arrived early
    fn become_ready(&mut self, w: WaypointId) -> Result<()> {
        let idx = w.0 as usize;
        let plan = self.plan;
        let waypoint = plan.waypoint(w);
        self.nodes[idx].preparing = false;
        self.nodes[idx].ready = true;
        debug!(waypoint = %waypoint.name(), "waypoint ready");

        match waypoint.kind() {
            WaypointKind::Scan(_) => self.fill_scan(w),
            WaypointKind::Gist(_) => {
                for query in waypoint.queries() {
                    self.new_round(w, query, None)?;
                }
            }
            _ => {
                for chunk in std::mem::take(&mut self.nodes[idx].waiting) {
                    self.deliver(w, chunk)?;
                }
            }
        }
        Ok(())
    }

    fn preprocessed(&mut self, w: WaypointId, constants: Vec<(QueryId, ConstantState)>) -> Result<()> {
        let queries = self.plan.waypoint(w).queries();
        let node = &mut self.nodes[w.0 as usize];
        node.constants = constants;
        if let NodeOp::Gla(run) = &mut node.op {
            run.active = queries;
        }
        self.become_ready(w)
    }

    fn gist_preprocessed(&mut self, w: WaypointId, states: Vec<(QueryId, OperatorState)>) -> Result<()> {
        let NodeOp::Gist(run) = &mut self.nodes[w.0 as usize].op else {
            return Err(Error::internal("gist states for a non-gist waypoint"));
        };
        run.queries = states
            .into_iter()
            .map(|(query, state)| {
                let gq = GistQuery {
                    state: Some(state),
                    ..GistQuery::default()
                };
                (query, gq)
            })
            .collect();
        self.become_ready(w)
    }

    fn states_arrived(&mut self, w: WaypointId, states: Vec<(QueryId, OperatorState)>) {
        let mut queries = Vec::with_capacity(states.len());
        if let NodeOp::Gla(run) = &mut self.nodes[w.0 as usize].op {
            run.chunks_in_flight -= 1;
            for (query, state) in states {
                run.partial.entry(query).or_default().push(state);
                queries.push(query);
            }
        }
        for query in queries {
            self.eager_merge(w, query);
        }
    }

    /// Merge as soon as a full batch of partial states is waiting
    fn eager_merge(&mut self, w: WaypointId, query: QueryId) {
        let batch = self.config.scheduler.merge_at_a_time.max(2);
        let mut merges = Vec::new();
        if let NodeOp::Gla(run) = &mut self.nodes[w.0 as usize].op {
            let parts = run.partial.entry(query).or_default();
            while parts.len() >= batch {
                let states: Vec<OperatorState> = parts.drain(..batch).collect();
                merges.push(states);
            }
            *run.merging.entry(query).or_insert(0) += merges.len();
        }
        for states in merges {
            self.enqueue(w, WorkDescription::GlaMerge { query, states });
        }
    }

    fn fragment_done(&mut self, w: WaypointId, query: QueryId, round: u32) {
        let mut closed = false;
        if let NodeOp::Gla(run) = &mut self.nodes[w.0 as usize].op {
            if let Some((closing_round, left)) = run.closing.get_mut(&query) {
                if *closing_round == round {
                    *left -= 1;
                    if *left == 0 {
                        run.closing.remove(&query);
                        closed = true;
                    }
                }
            }
        }
        if closed {
            self.enqueue(w, WorkDescription::GlaPostFinalize { query });
        }
    }

    fn enqueue_fragments(&mut self, w: WaypointId, query: QueryId, state: OperatorState, fragments: usize, round: u32) {
        let state = Arc::new(state);
        for fragment in 0..fragments {
            self.enqueue(
                w,
                WorkDescription::GlaFinalize {
                    query,
                    state: state.clone(),
                    fragment,
                    round,
                },
            );
        }
    }

    /// End-of-round handling for aggregates: merge what is left, send each
    /// query to PreFinalize, and start the next round once every query of the
    /// current one settled
    fn advance_gla(&mut self, w: WaypointId) -> Result<()> {
        let idx = w.0 as usize;
        let batch = self.config.scheduler.merge_at_a_time.max(2);
        loop {
            let node = &mut self.nodes[idx];
            if !(node.ready && node.input_done && node.waiting.is_empty()) {
                return Ok(());
            }
            let NodeOp::Gla(run) = &mut node.op else {
                return Ok(());
            };
            if run.chunks_in_flight > 0 {
                return Ok(());
            }

            let mut merges = Vec::new();
            let mut settle = Vec::new();
            for query in run.active {
                if run.merging.get(&query).copied().unwrap_or(0) > 0 {
                    continue;
                }
                let parts = run.partial.entry(query).or_default();
                if parts.len() > 1 {
                    let mut all: Vec<OperatorState> = std::mem::take(parts);
                    while all.len() > 1 {
                        let take = batch.min(all.len());
                        merges.push((query, all.drain(..take).collect::<Vec<_>>()));
                    }
                    parts.extend(all);
                    continue;
                }

                let state = run.partial.remove(&query).and_then(|mut v| v.pop());
                let constant = node
                    .constants
                    .iter()
                    .find(|(q, _)| *q == query)
                    .map(|(_, c)| c.clone())
                    .ok_or_else(|| Error::internal(format!("no constant state for {query}")))?;
                run.active.remove(query);
                run.settling.insert(query);
                settle.push(WorkDescription::GlaPreFinalize { query, state, constant });
            }
            for (query, _) in &merges {
                *run.merging.entry(*query).or_insert(0) += 1;
            }

            let mut replays = Vec::new();
            let mut started_round = false;
            if run.active.is_empty() && run.settling.is_empty() && !run.next_active.is_empty() {
                run.round += 1;
                run.active = std::mem::replace(&mut run.next_active, QueryIdSet::EMPTY);
                started_round = true;
                for chunk in &run.replay {
                    let constants = constants_for(&node.constants, chunk.queries().intersect(run.active));
                    if !constants.is_empty() {
                        replays.push((chunk.clone(), constants));
                    }
                }
                run.chunks_in_flight += replays.len();
                self.stats.rounds.insert(w, run.round + 1);
                debug!(%w, round = run.round, chunks = replays.len(), "aggregate iterates");
            }

            let nothing_dispatched = merges.is_empty() && settle.is_empty() && replays.is_empty();
            for (query, states) in merges {
                self.enqueue(w, WorkDescription::GlaMerge { query, states });
            }
            for work in settle {
                self.enqueue(w, work);
            }
            for (chunk, constants) in replays {
                self.enqueue(w, WorkDescription::GlaChunk { chunk, constants });
            }
            // a round over an empty replay buffer ends at once
            if !(started_round && nothing_dispatched) {
                return Ok(());
            }
        }
    }

    fn pre_finalized(
        &mut self,
        w: WaypointId,
        next: NextStage,
        query: QueryId,
        constant: ConstantState,
        settled: Settled,
    ) -> Result<()> {
        let node = &mut self.nodes[w.0 as usize];
        if let Some(slot) = node.constants.iter_mut().find(|(q, _)| *q == query) {
            slot.1 = constant;
        }
        let NodeOp::Gla(run) = &mut node.op else {
            return Err(Error::internal("pre-finalize result for a non-aggregate waypoint"));
        };
        run.settling.remove(query);
        let round = run.round;
        debug!(%w, %query, round, ?next, "pre-finalized");

        match (next, settled) {
            (NextStage::Process, Settled::Rows { state, fragments }) => {
                run.next_active.insert(query);
                if run.op.produce_intermediates(query) {
                    self.enqueue_fragments(w, query, state, fragments, round);
                }
            }
            (NextStage::Finalize, Settled::Rows { state, fragments }) => {
                run.closing.insert(query, (round, fragments));
                self.enqueue_fragments(w, query, state, fragments, round);
            }
            (NextStage::PostFinalize, Settled::Constant(constant)) => {
                self.finalized.insert((w, query), constant);
                self.enqueue(w, WorkDescription::GlaPostFinalize { query });
            }
            (next, settled) => {
                return Err(Error::internal(format!(
                    "pre-finalize of {query} produced {settled:?} headed for {next:?}"
                )));
            }
        }
        Ok(())
    }

    fn gist_query(&mut self, w: WaypointId, query: QueryId) -> Result<&mut GistQuery> {
        let NodeOp::Gist(run) = &mut self.nodes[w.0 as usize].op else {
            return Err(Error::internal("gist work for a non-gist waypoint"));
        };
        run.queries
            .get_mut(&query)
            .ok_or_else(|| Error::internal(format!("no gist state for {query}")))
    }

    /// Send the query's state to NewRound along with the round that just
    /// ended, if any
    fn new_round(&mut self, w: WaypointId, query: QueryId, merged: Option<OperatorState>) -> Result<()> {
        let state = self
            .gist_query(w, query)?
            .state
            .take()
            .ok_or_else(|| Error::internal(format!("gist state of {query} is already out")))?;
        self.enqueue(w, WorkDescription::GistNewRound { query, state, merged });
        Ok(())
    }

    fn round_planned(&mut self, w: WaypointId, query: QueryId, state: OperatorState, plan: RoundPlan) -> Result<()> {
        let RoundPlan { snapshot, schedulers } = plan;
        let gq = self.gist_query(w, query)?;
        gq.state = Some(state);
        gq.steps_left = schedulers.len();
        gq.snapshot = Some(snapshot.clone());
        debug!(%w, %query, round = gq.round, schedulers = gq.steps_left, "gist round");
        for scheduler in schedulers {
            self.enqueue(
                w,
                WorkDescription::GistSteps {
                    query,
                    snapshot: snapshot.clone(),
                    scheduler,
                },
            );
        }
        Ok(())
    }

    fn steps_done(&mut self, w: WaypointId, query: QueryId, round: OperatorState) -> Result<()> {
        let gq = self.gist_query(w, query)?;
        gq.rounds.push(round);
        gq.steps_left -= 1;
        if gq.steps_left > 0 {
            return Ok(());
        }
        let snapshot = gq
            .snapshot
            .take()
            .ok_or_else(|| Error::internal("gist round without snapshot"))?;
        let rounds = std::mem::take(&mut gq.rounds);
        self.enqueue(w, WorkDescription::GistMerge { query, snapshot, rounds });
        Ok(())
    }

    fn round_merged(&mut self, w: WaypointId, query: QueryId, merged: OperatorState) -> Result<()> {
        let gq = self.gist_query(w, query)?;
        gq.round += 1;
        let round = gq.round;
        let rounds = self.stats.rounds.entry(w).or_insert(0);
        *rounds = (*rounds).max(round);
        self.new_round(w, query, Some(merged))
    }

    fn converged(&mut self, w: WaypointId, query: QueryId, state: OperatorState) -> Result<()> {
        let gq = self.gist_query(w, query)?;
        gq.converged = true;
        debug!(%w, %query, rounds = gq.round, "gist converged");
        self.enqueue(w, WorkDescription::GistFinalize { query, state });
        Ok(())
    }

    /// Overfull build segments escalate to a cleaner pass that spills the
    /// advised owners
    fn join_built(&mut self, w: WaypointId, built: JoinBuildResult) {
        if built.overfull.is_empty() {
            return;
        }
        self.stats.overfull_events += built.overfull.len() as u64;
        // records of finished builds may be under a concurrent probe
        let building: Vec<WaypointId> = self
            .plan
            .waypoints()
            .iter()
            .filter_map(|d| match d.kind() {
                WaypointKind::JoinRhs(rhs) if !self.nodes[d.id().0 as usize].done => Some(rhs.waypoint()),
                _ => None,
            })
            .collect();
        let advice: Vec<EvictionAdvice> = self
            .cleaner
            .advise(&built.samples, self.config.table.max_fill_rate)
            .into_iter()
            .filter_map(|mut item| {
                item.ranked.retain(|(owner, _)| building.contains(owner));
                (!item.ranked.is_empty()).then_some(item)
            })
            .collect();
        for item in &advice {
            warn!(
                waypoint = %self.name(w),
                segment = item.segment,
                fill = item.sampled_fill,
                ranked = ?item.ranked,
                "segment overfull; cleaner spills join records"
            );
        }
        self.stats.cleaner_advice += advice.len() as u64;
        if !advice.is_empty() {
            self.enqueue(w, WorkDescription::JoinClean { advice });
        }
    }

    fn is_finished(&self, w: WaypointId) -> bool {
        let node = &self.nodes[w.0 as usize];
        if !(node.ready && node.input_done && node.waiting.is_empty() && node.in_flight == 0) {
            return false;
        }
        match &node.op {
            NodeOp::Scan { next, total, .. } => next >= total,
            NodeOp::Stream => true,
            NodeOp::Gla(run) => {
                run.active.is_empty()
                    && run.settling.is_empty()
                    && run.next_active.is_empty()
                    && run.closing.is_empty()
            }
            NodeOp::Gist(run) => run.queries.values().all(|g| g.converged),
        }
    }

    fn progress(&mut self, w: WaypointId) -> Result<()> {
        if self.nodes[w.0 as usize].done {
            return Ok(());
        }
        if matches!(self.nodes[w.0 as usize].op, NodeOp::Gla(_)) {
            self.advance_gla(w)?;
        }
        if !self.is_finished(w) {
            return Ok(());
        }
        self.finish(w)
    }

    fn finish(&mut self, w: WaypointId) -> Result<()> {
        let idx = w.0 as usize;
        self.nodes[idx].done = true;
        self.nodes[idx].constants.clear();
        if let NodeOp::Gla(run) = &mut self.nodes[idx].op {
            run.replay.clear();
        }
        let plan = self.plan;
        let waypoint = plan.waypoint(w);
        debug!(waypoint = %waypoint.name(), kind = waypoint.kind().label(), "waypoint done");

        for &consumer in &waypoint.consumers {
            self.nodes[consumer.0 as usize].input_done = true;
            self.progress(consumer)?;
        }
        let dependents: Vec<WaypointId> = plan
            .waypoints()
            .iter()
            .filter(|d| {
                d.constant_inputs.contains(&w)
                    || matches!(d.kind(), WaypointKind::JoinLhs(lhs) if lhs.rhs() == w)
            })
            .map(|d| d.id())
            .collect();
        for dependent in dependents {
            self.try_ready(dependent)?;
        }
        if let WaypointKind::JoinLhs(lhs) = waypoint.kind() {
            let rhs = lhs.rhs();
            if let Some(left) = self.probes_left.get_mut(&rhs) {
                *left -= 1;
                if *left == 0 {
                    self.enqueue(rhs, WorkDescription::JoinPurge);
                }
            }
        }
        Ok(())
    }
}

fn constants_for(constants: &[(QueryId, ConstantState)], queries: QueryIdSet) -> Vec<(QueryId, ConstantState)> {
    constants
        .iter()
        .filter(|(q, _)| queries.contains(*q))
        .cloned()
        .collect()
}
