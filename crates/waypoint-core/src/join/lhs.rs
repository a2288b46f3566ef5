//! Probe side: match left-hand tuples against a table snapshot

use crate::chunk::{Chunk, Column, DataType, QueryIdSet, SlotId, Value, WaypointId};
use crate::error::{Error, Result};
use crate::hash::{RecordView, SpilledRecords, TableView, hash_key};

/// How each query running through a probe waypoint joins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinQueries {
    /// Inner join: one row per match
    pub inner: QueryIdSet,
    /// Semi join: the left tuple once if any match exists
    pub exists: QueryIdSet,
    /// Anti join: the left tuple once if no match exists
    pub not_exists: QueryIdSet,
    /// Left outer join: matches, or the left tuple padded with nulls
    pub outer: QueryIdSet,
}

impl JoinQueries {
    /// Every query handled by the waypoint
    pub fn all(&self) -> QueryIdSet {
        self.inner
            .union(self.exists)
            .union(self.not_exists)
            .union(self.outer)
    }

    /// A query may join only one way
    pub fn validate(&self) -> Result<()> {
        let sets = [self.inner, self.exists, self.not_exists, self.outer];
        for (i, a) in sets.iter().enumerate() {
            for b in &sets[i + 1..] {
                if a.overlaps(*b) {
                    return Err(Error::hash_table(format!(
                        "queries {:?} assigned to more than one join kind",
                        a.intersect(*b)
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Configuration of a join's probe side
#[derive(Debug, Clone)]
pub struct JoinLhs {
    rhs: WaypointId,
    keys: Vec<SlotId>,
    payload: Vec<(SlotId, DataType)>,
    queries: JoinQueries,
}

impl JoinLhs {
    /// Probe side matching against records written by `rhs`.
    ///
    /// `keys` are the left key slots, in the same order as the build side's
    /// keys. `payload` lists the output slot and type of each build-side
    /// payload column.
    pub fn new(
        rhs: WaypointId,
        keys: Vec<SlotId>,
        payload: Vec<(SlotId, DataType)>,
        queries: JoinQueries,
    ) -> Result<Self> {
        queries.validate()?;
        Ok(Self {
            rhs,
            keys,
            payload,
            queries,
        })
    }

    /// Build waypoint whose records this side reads
    pub fn rhs(&self) -> WaypointId {
        self.rhs
    }

    /// Join kinds per query
    pub fn queries(&self) -> &JoinQueries {
        &self.queries
    }

    /// Output slots filled from the build side
    pub fn payload(&self) -> &[(SlotId, DataType)] {
        &self.payload
    }

    /// Join one chunk against the table snapshot plus whatever the cleaner
    /// spilled for the build side.
    ///
    /// Left columns pass through without copying when every left tuple yields
    /// exactly one output row; otherwise they are gathered row by row.
    pub fn probe_chunk(
        &self,
        view: &TableView,
        spilled: Option<&SpilledRecords>,
        mut chunk: Chunk,
    ) -> Result<Chunk> {
        let running = self.queries.all();
        let emit_matches = self.queries.inner.union(self.queries.outer);
        let num_keys = self.keys.len();

        let mut tuples: Vec<usize> = Vec::with_capacity(chunk.num_tuples());
        let mut masks: Vec<QueryIdSet> = Vec::with_capacity(chunk.num_tuples());
        let mut payload: Vec<Column> = self
            .payload
            .iter()
            .map(|(_, dt)| Column::with_capacity(*dt, chunk.num_tuples()))
            .collect();

        let mut key_bytes: Vec<Vec<u8>> = vec![Vec::new(); num_keys];
        for tuple in 0..chunk.num_tuples() {
            let cur = chunk.bitstring()[tuple].intersect(running);
            if cur.is_empty() {
                continue;
            }
            let key = chunk.row(tuple, &self.keys)?;
            let mut matched = QueryIdSet::EMPTY;

            // null keys never match
            if !key.iter().any(Value::is_null) {
                for (bytes, value) in key_bytes.iter_mut().zip(&key) {
                    bytes.clear();
                    value.encode(bytes);
                }
                let hash = hash_key(&key);
                let stored = view
                    .probe(hash)
                    .into_iter()
                    .flatten()
                    .filter(|h| h.waypoint == self.rhs)
                    .map(|h| h.record);
                let moved = spilled.into_iter().flat_map(|s| s.probe(hash));
                for bytes in stored.chain(moved) {
                    let record = RecordView::parse(bytes)?;
                    let bits = record.bitstring().intersect(cur);
                    if bits.is_empty() || !keys_equal(&record, &key_bytes)? {
                        continue;
                    }
                    matched = matched.union(bits);
                    let mask = bits.intersect(emit_matches);
                    if mask.is_empty() {
                        continue;
                    }
                    tuples.push(tuple);
                    masks.push(mask);
                    for (i, ((_, dt), column)) in self.payload.iter().zip(payload.iter_mut()).enumerate() {
                        let value = match record.field((num_keys + i) as SlotId)? {
                            Some(bytes) => Value::decode(*dt, bytes)?,
                            None => Value::Null,
                        };
                        column.push(value)?;
                    }
                }
            }

            let semi = self.queries.exists.intersect(matched);
            let anti = cur.intersect(self.queries.not_exists).difference(matched);
            let unmatched_outer = cur.intersect(self.queries.outer).difference(matched);
            let left_only = semi.union(anti).union(unmatched_outer);
            if !left_only.is_empty() {
                tuples.push(tuple);
                masks.push(left_only);
                for column in payload.iter_mut() {
                    column.push_null();
                }
            }
        }

        let shallow =
            tuples.len() == chunk.num_tuples() && tuples.iter().enumerate().all(|(i, &t)| i == t);
        let sequence = chunk.sequence();
        let slots: Vec<SlotId> = chunk.slots().collect();

        let mut out = Chunk::new(Vec::new(), masks)?.with_sequence(sequence);
        for slot in slots {
            if self.payload.iter().any(|(s, _)| *s == slot) {
                return Err(Error::chunk(format!(
                    "join output slot {slot} collides with a left column"
                )));
            }
            if shallow {
                out.put_shared(slot, chunk.take_shared(slot)?)?;
            } else {
                out.put_column(slot, chunk.require_column(slot)?.take(&tuples)?)?;
            }
        }
        for ((slot, _), column) in self.payload.iter().zip(payload) {
            out.put_column(*slot, column)?;
        }
        Ok(out)
    }
}

fn keys_equal(record: &RecordView<'_>, key_bytes: &[Vec<u8>]) -> Result<bool> {
    for (i, expected) in key_bytes.iter().enumerate() {
        match record.field(i as SlotId)? {
            Some(stored) if stored == expected.as_slice() => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}
