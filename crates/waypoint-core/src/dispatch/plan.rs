//! Query plans
//!
//! A [`Plan`] is a DAG of waypoints. Every non-source waypoint has exactly
//! one data input; waypoints may additionally read the finalized states of
//! other waypoints as constant inputs, and a join's probe side waits for its
//! build side. Queries are routed along paths through the DAG and leave it at
//! exactly one exit waypoint.
//!
//! ```text
//!   scan ──▶ compact ──▶ join rhs
//!     │                     ┊ (built)
//!     └────▶ join lhs ◀┄┄┄┄┄┘ ──▶ gla ──▶ exit
//! ```

use super::work::{
    CompactRunner, GistRunner, GlaRunner, GtRunner, JoinLhsRunner, JoinRhsRunner, ScanRunner,
    StageRunner,
};
use crate::chunk::{Chunk, QueryExit, QueryId, QueryIdSet, WaypointId};
use crate::error::{Error, Result};
use crate::join::{JoinLhs, JoinRhs};
use crate::operator::{GistOps, GlaOps, GtOps};
use crate::tokens::{HIGHEST_PRIORITY, Priority};
use std::fmt;
use std::sync::Arc;

/// Producer of the chunks a scan waypoint reads
pub trait ChunkSource: Send + Sync {
    /// Number of chunks available
    fn num_chunks(&self) -> usize;

    /// Read one chunk. Called from worker threads under a disk token.
    fn read_chunk(&self, index: usize) -> Result<Chunk>;
}

/// Chunks held in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    chunks: Vec<Chunk>,
}

impl MemorySource {
    /// Serve `chunks` in order
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }
}

impl ChunkSource for MemorySource {
    fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn read_chunk(&self, index: usize) -> Result<Chunk> {
        self.chunks
            .get(index)
            .cloned()
            .ok_or_else(|| Error::chunk(format!("chunk {index} out of range ({})", self.chunks.len())))
    }
}

/// Operator a waypoint runs
#[derive(Clone)]
pub enum WaypointKind {
    /// Reads chunks from a source
    Scan(Arc<dyn ChunkSource>),
    /// Drops dead tuples
    Compact,
    /// Generalized transform
    Gt(Arc<dyn GtOps>),
    /// Generalized aggregate
    Gla(Arc<dyn GlaOps>),
    /// Iterative transform
    Gist(Arc<dyn GistOps>),
    /// Join build side
    JoinRhs(Arc<JoinRhs>),
    /// Join probe side
    JoinLhs(Arc<JoinLhs>),
}

impl WaypointKind {
    /// Short name of the kind
    pub fn label(&self) -> &'static str {
        match self {
            WaypointKind::Scan(_) => "scan",
            WaypointKind::Compact => "compact",
            WaypointKind::Gt(_) => "gt",
            WaypointKind::Gla(_) => "gla",
            WaypointKind::Gist(_) => "gist",
            WaypointKind::JoinRhs(_) => "join-rhs",
            WaypointKind::JoinLhs(_) => "join-lhs",
        }
    }

    fn is_source(&self) -> bool {
        matches!(self, WaypointKind::Scan(_) | WaypointKind::Gist(_))
    }

    fn emits_chunks(&self) -> bool {
        match self {
            WaypointKind::JoinRhs(_) => false,
            WaypointKind::Gla(op) => !op.finalize_as_state(),
            _ => true,
        }
    }
}

impl fmt::Debug for WaypointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One operator node of a plan
pub struct Waypoint {
    pub(crate) id: WaypointId,
    pub(crate) name: String,
    pub(crate) kind: WaypointKind,
    pub(crate) input: Option<WaypointId>,
    pub(crate) constant_inputs: Vec<WaypointId>,
    pub(crate) priority: Priority,
    pub(crate) queries: QueryIdSet,
    pub(crate) exits: QueryIdSet,
    pub(crate) consumers: Vec<WaypointId>,
    pub(crate) runner: Arc<dyn StageRunner>,
}

impl Waypoint {
    /// Identifier
    pub fn id(&self) -> WaypointId {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operator kind
    pub fn kind(&self) -> &WaypointKind {
        &self.kind
    }

    /// Queries running through the waypoint
    pub fn queries(&self) -> QueryIdSet {
        self.queries
    }

    pub(crate) fn query_exits(&self) -> Vec<QueryExit> {
        self.exits
            .iter()
            .map(|query| QueryExit { query, exit: self.id })
            .collect()
    }
}

impl fmt::Debug for Waypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waypoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("input", &self.input)
            .field("constant_inputs", &self.constant_inputs)
            .field("priority", &self.priority)
            .field("queries", &self.queries)
            .field("exits", &self.exits)
            .finish()
    }
}

/// A validated plan, ready for [`ExecutionEngine::run`](super::ExecutionEngine::run)
#[derive(Debug)]
pub struct Plan {
    pub(crate) waypoints: Vec<Waypoint>,
    pub(crate) exits: Vec<QueryExit>,
}

impl Plan {
    /// Waypoints in id order
    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    /// Exit of every query
    pub fn exits(&self) -> &[QueryExit] {
        &self.exits
    }

    /// All queries of the plan
    pub fn queries(&self) -> QueryIdSet {
        self.exits.iter().map(|e| e.query).collect()
    }

    pub(crate) fn waypoint(&self, id: WaypointId) -> &Waypoint {
        &self.waypoints[id.0 as usize]
    }
}

struct PendingWaypoint {
    name: String,
    kind: WaypointKind,
    input: Option<WaypointId>,
    constant_inputs: Vec<WaypointId>,
    priority: Priority,
}

/// Incremental plan construction.
///
/// Waypoints can only name earlier waypoints as inputs, so every plan built
/// here is acyclic.
#[derive(Default)]
pub struct PlanBuilder {
    waypoints: Vec<PendingWaypoint>,
    routes: Vec<(QueryId, Vec<WaypointId>)>,
    exits: Vec<QueryExit>,
}

impl PlanBuilder {
    /// Empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Next waypoint id to be handed out; join build sides need it up front
    pub fn next_id(&self) -> WaypointId {
        WaypointId(self.waypoints.len() as u32)
    }

    fn add(&mut self, name: impl Into<String>, kind: WaypointKind, input: Option<WaypointId>) -> WaypointId {
        let id = self.next_id();
        self.waypoints.push(PendingWaypoint {
            name: name.into(),
            kind,
            input,
            constant_inputs: Vec::new(),
            priority: HIGHEST_PRIORITY,
        });
        id
    }

    /// Scan waypoint over `source`
    pub fn scan(&mut self, name: impl Into<String>, source: Arc<dyn ChunkSource>) -> WaypointId {
        self.add(name, WaypointKind::Scan(source), None)
    }

    /// Compaction of `input`'s chunks
    pub fn compact(&mut self, name: impl Into<String>, input: WaypointId) -> WaypointId {
        self.add(name, WaypointKind::Compact, Some(input))
    }

    /// Transform of `input`'s chunks
    pub fn gt(&mut self, name: impl Into<String>, input: WaypointId, op: Arc<dyn GtOps>) -> WaypointId {
        self.add(name, WaypointKind::Gt(op), Some(input))
    }

    /// Aggregate over `input`'s chunks
    pub fn gla(&mut self, name: impl Into<String>, input: WaypointId, op: Arc<dyn GlaOps>) -> WaypointId {
        self.add(name, WaypointKind::Gla(op), Some(input))
    }

    /// Iterative transform; it reads nothing but its constant inputs
    pub fn gist(&mut self, name: impl Into<String>, op: Arc<dyn GistOps>) -> WaypointId {
        self.add(name, WaypointKind::Gist(op), None)
    }

    /// Join build side. `rhs.waypoint()` must equal [`next_id`](Self::next_id).
    pub fn join_rhs(&mut self, name: impl Into<String>, input: WaypointId, rhs: JoinRhs) -> WaypointId {
        self.add(name, WaypointKind::JoinRhs(Arc::new(rhs)), Some(input))
    }

    /// Join probe side
    pub fn join_lhs(&mut self, name: impl Into<String>, input: WaypointId, lhs: JoinLhs) -> WaypointId {
        self.add(name, WaypointKind::JoinLhs(Arc::new(lhs)), Some(input))
    }

    /// Feed `from`'s finalized state to `to` as its next constant input
    pub fn constant_input(&mut self, to: WaypointId, from: WaypointId) -> &mut Self {
        if let Some(w) = self.waypoints.get_mut(to.0 as usize) {
            w.constant_inputs.push(from);
        }
        self
    }

    /// Dispatch priority of a waypoint's work; lower runs first
    pub fn priority(&mut self, waypoint: WaypointId, priority: Priority) -> &mut Self {
        if let Some(w) = self.waypoints.get_mut(waypoint.0 as usize) {
            w.priority = priority;
        }
        self
    }

    /// Run `query` along `path`, leaving the plan at its last waypoint
    pub fn query(&mut self, query: QueryId, path: &[WaypointId]) -> &mut Self {
        if let Some(&exit) = path.last() {
            self.exits.push(QueryExit { query, exit });
        }
        self.route(query, path)
    }

    /// Run `query` along a side path that feeds constant inputs or a join
    /// build side; the query does not exit there
    pub fn route(&mut self, query: QueryId, path: &[WaypointId]) -> &mut Self {
        self.routes.push((query, path.to_vec()));
        self
    }

    /// Validate and resolve stage runners
    pub fn build(self) -> Result<Plan> {
        let n = self.waypoints.len();
        let name_of = |id: WaypointId| {
            self.waypoints
                .get(id.0 as usize)
                .map_or_else(|| id.to_string(), |w| w.name.clone())
        };
        let check_id = |id: WaypointId, context: &str| -> Result<()> {
            if (id.0 as usize) < n {
                Ok(())
            } else {
                Err(Error::plan(id.to_string(), None, format!("unknown waypoint in {context}")))
            }
        };

        let mut queries = vec![QueryIdSet::EMPTY; n];
        let mut exits = vec![QueryIdSet::EMPTY; n];
        let mut consumers = vec![Vec::new(); n];

        for (i, w) in self.waypoints.iter().enumerate() {
            let id = WaypointId(i as u32);
            match (w.kind.is_source(), w.input) {
                (true, Some(_)) => {
                    return Err(Error::plan(w.name.clone(), None, "source waypoints take no data input"));
                }
                (false, None) => {
                    return Err(Error::plan(w.name.clone(), None, "missing data input"));
                }
                (false, Some(input)) => {
                    if input.0 as usize >= i {
                        return Err(Error::plan(
                            w.name.clone(),
                            None,
                            format!("input {input} is not an earlier waypoint"),
                        ));
                    }
                    if !self.waypoints[input.0 as usize].kind.emits_chunks() {
                        return Err(Error::plan(
                            w.name.clone(),
                            None,
                            format!("input {} produces no chunks", name_of(input)),
                        ));
                    }
                    consumers[input.0 as usize].push(id);
                }
                (true, None) => {}
            }
            for &c in &w.constant_inputs {
                check_id(c, "constant input")?;
                let ok = matches!(&self.waypoints[c.0 as usize].kind,
                    WaypointKind::Gla(op) if op.finalize_as_state());
                if !ok || c.0 as usize >= i {
                    return Err(Error::plan(
                        w.name.clone(),
                        None,
                        format!("constant input {} is not an earlier state-producing aggregate", name_of(c)),
                    ));
                }
            }
            if let WaypointKind::JoinRhs(rhs) = &w.kind {
                if rhs.waypoint() != id {
                    return Err(Error::plan(
                        w.name.clone(),
                        None,
                        format!("build side tags records as {} but is waypoint {id}", rhs.waypoint()),
                    ));
                }
            }
            if let WaypointKind::JoinLhs(lhs) = &w.kind {
                check_id(lhs.rhs(), "join")?;
                if !matches!(self.waypoints[lhs.rhs().0 as usize].kind, WaypointKind::JoinRhs(_)) {
                    return Err(Error::plan(
                        w.name.clone(),
                        None,
                        format!("{} is not a join build side", name_of(lhs.rhs())),
                    ));
                }
            }
        }

        for (query, path) in &self.routes {
            let Some(&first) = path.first() else {
                return Err(Error::plan("plan", Some(*query), "empty path"));
            };
            check_id(first, "path")?;
            if !self.waypoints[first.0 as usize].kind.is_source() {
                return Err(Error::plan(name_of(first), Some(*query), "path does not start at a source"));
            }
            for pair in path.windows(2) {
                check_id(pair[1], "path")?;
                if self.waypoints[pair[1].0 as usize].input != Some(pair[0]) {
                    return Err(Error::plan(
                        name_of(pair[1]),
                        Some(*query),
                        format!("path step from {} follows no data edge", name_of(pair[0])),
                    ));
                }
            }
            for id in path {
                queries[id.0 as usize].insert(*query);
            }
        }

        let mut seen = QueryIdSet::EMPTY;
        for exit in &self.exits {
            if seen.contains(exit.query) {
                return Err(Error::plan(name_of(exit.exit), Some(exit.query), "query has two exits"));
            }
            seen.insert(exit.query);
            if !self.waypoints[exit.exit.0 as usize].kind.emits_chunks() {
                return Err(Error::plan(name_of(exit.exit), Some(exit.query), "exit waypoint produces no rows"));
            }
            exits[exit.exit.0 as usize].insert(exit.query);
        }
        let routed: QueryIdSet = self.routes.iter().map(|(q, _)| *q).collect();
        let stranded = routed.difference(seen);
        if let Some(query) = stranded.first() {
            return Err(Error::plan("plan", Some(query), "query has no exit"));
        }

        for (i, w) in self.waypoints.iter().enumerate() {
            for &c in &w.constant_inputs {
                let missing = queries[i].difference(queries[c.0 as usize]);
                if let Some(query) = missing.first() {
                    return Err(Error::plan(
                        w.name.clone(),
                        Some(query),
                        format!("query does not run through constant input {}", name_of(c)),
                    ));
                }
            }
            if let WaypointKind::JoinLhs(lhs) = &w.kind {
                let missing = queries[i].difference(queries[lhs.rhs().0 as usize]);
                if let Some(query) = missing.first() {
                    return Err(Error::plan(
                        w.name.clone(),
                        Some(query),
                        format!("query does not build {}", name_of(lhs.rhs())),
                    ));
                }
            }
        }

        let waypoints = self
            .waypoints
            .into_iter()
            .enumerate()
            .map(|(i, w)| {
                let runner: Arc<dyn StageRunner> = match &w.kind {
                    WaypointKind::Scan(source) => Arc::new(ScanRunner {
                        source: source.clone(),
                        queries: queries[i],
                        name: w.name.clone(),
                    }),
                    WaypointKind::Compact => Arc::new(CompactRunner),
                    WaypointKind::Gt(op) => Arc::new(GtRunner {
                        op: op.clone(),
                        name: w.name.clone(),
                    }),
                    WaypointKind::Gla(op) => Arc::new(GlaRunner {
                        op: op.clone(),
                        name: w.name.clone(),
                    }),
                    WaypointKind::Gist(op) => Arc::new(GistRunner {
                        op: op.clone(),
                        name: w.name.clone(),
                    }),
                    WaypointKind::JoinRhs(rhs) => Arc::new(JoinRhsRunner { rhs: rhs.clone() }),
                    WaypointKind::JoinLhs(lhs) => Arc::new(JoinLhsRunner { lhs: lhs.clone() }),
                };
                Waypoint {
                    id: WaypointId(i as u32),
                    name: w.name,
                    kind: w.kind,
                    input: w.input,
                    constant_inputs: w.constant_inputs,
                    priority: w.priority,
                    queries: queries[i],
                    exits: exits[i],
                    consumers: std::mem::take(&mut consumers[i]),
                    runner,
                }
            })
            .collect();

        Ok(Plan {
            waypoints,
            exits: self.exits,
        })
    }
}
