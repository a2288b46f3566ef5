//! Per-query outputs and run statistics

use super::work::StageTag;
use crate::chunk::{Chunk, QueryId, SlotId, Value, WaypointId};
use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Rows a query produced at its exit
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutput {
    /// Slots of the exit waypoint's output, ascending
    pub columns: Vec<SlotId>,
    /// Rows in chunk sequence order
    pub rows: Vec<Vec<Value>>,
}

impl QueryOutput {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the query produced nothing
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one output column
    pub fn column(&self, slot: SlotId) -> Option<Vec<&Value>> {
        let i = self.columns.iter().position(|s| *s == slot)?;
        Some(self.rows.iter().map(|r| &r[i]).collect())
    }
}

/// Counters collected over one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    /// Chunks read by scans
    pub chunks_scanned: u64,
    /// Stage invocations by stage
    pub stage_invocations: BTreeMap<StageTag, u64>,
    /// Time spent in each stage, summed over workers
    #[serde(serialize_with = "serialize_durations")]
    pub stage_time: BTreeMap<StageTag, Duration>,
    /// Segments that sampled above the overfull threshold
    pub overfull_events: u64,
    /// Segments the cleaner advised evicting from
    pub cleaner_advice: u64,
    /// Cleaner passes run during the join builds
    pub cleaner_passes: u64,
    /// Join records the cleaner moved out of the table
    pub records_spilled: u64,
    /// Join records dropped after their probe side finished
    pub records_purged: u64,
    /// Iteration rounds per waypoint, for iterative operators
    pub rounds: BTreeMap<WaypointId, u32>,
    /// Wall time of the run
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl RunStats {
    /// Total stage invocations
    pub fn invocations(&self) -> u64 {
        self.stage_invocations.values().sum()
    }

    pub(crate) fn record(&mut self, tag: StageTag, elapsed: Duration) {
        *self.stage_invocations.entry(tag).or_default() += 1;
        *self.stage_time.entry(tag).or_default() += elapsed;
    }
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

fn serialize_durations<S: serde::Serializer>(
    d: &BTreeMap<StageTag, Duration>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = s.serialize_map(Some(d.len()))?;
    for (tag, time) in d {
        map.serialize_entry(tag, &(time.as_secs_f64() * 1000.0))?;
    }
    map.end()
}

/// Everything a run produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResults {
    /// Output of each query, by query
    pub outputs: BTreeMap<QueryId, QueryOutput>,
    /// Run counters
    pub stats: RunStats,
}

impl QueryResults {
    /// Output of one query
    pub fn output(&self, query: QueryId) -> Option<&QueryOutput> {
        self.outputs.get(&query)
    }
}

/// Gathers exit chunks and restores sequence order at the end
#[derive(Debug, Default)]
pub(crate) struct ExitCollector {
    pending: BTreeMap<QueryId, (Vec<SlotId>, Vec<(u64, Vec<Value>)>)>,
}

impl ExitCollector {
    pub(crate) fn register(&mut self, query: QueryId, columns: Vec<SlotId>) {
        self.pending.entry(query).or_insert_with(|| (columns, Vec::new()));
    }

    /// Keep the rows of `chunk` that are live for `query`
    pub(crate) fn collect(&mut self, query: QueryId, chunk: &Chunk) -> Result<()> {
        let (columns, rows) = self.pending.entry(query).or_default();
        if columns.is_empty() {
            *columns = chunk.slots().collect();
        }
        for (tuple, mask) in chunk.bitstring().iter().enumerate() {
            if mask.contains(query) {
                rows.push((chunk.sequence(), chunk.row(tuple, columns)?));
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> BTreeMap<QueryId, QueryOutput> {
        self.pending
            .into_iter()
            .map(|(query, (columns, mut rows))| {
                rows.sort_by_key(|(sequence, _)| *sequence);
                let rows = rows.into_iter().map(|(_, row)| row).collect();
                (query, QueryOutput { columns, rows })
            })
            .collect()
    }
}
