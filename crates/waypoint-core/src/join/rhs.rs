//! Build side: serialize right-hand tuples into the central table

use crate::chunk::{Chunk, DataType, QueryIdSet, SlotId, WaypointId};
use crate::error::Result;
use crate::hash::{RecordBuilder, SegmentMask, SegmentSample, SegmentedHashTable, hash_key};
use rand::Rng;

/// Configuration of a join's build side.
///
/// Records store the key columns at record slots `0..keys` followed by the
/// payload columns, so the probe side can compare keys before decoding
/// anything else.
#[derive(Debug, Clone)]
pub struct JoinRhs {
    waypoint: WaypointId,
    keys: Vec<(SlotId, DataType)>,
    payload: Vec<(SlotId, DataType)>,
}

/// Outcome of inserting one chunk
#[derive(Debug, Clone, Default)]
pub struct JoinBuildResult {
    /// Records written
    pub inserted: usize,
    /// Fill samples taken after writing each segment
    pub samples: Vec<(usize, SegmentSample)>,
    /// Segments whose sample reached the overfull threshold
    pub overfull: Vec<usize>,
}

impl JoinRhs {
    /// Build side owned by `waypoint`
    pub fn new(
        waypoint: WaypointId,
        keys: Vec<(SlotId, DataType)>,
        payload: Vec<(SlotId, DataType)>,
    ) -> Self {
        Self {
            waypoint,
            keys,
            payload,
        }
    }

    /// Owning waypoint; every record is tagged with it
    pub fn waypoint(&self) -> WaypointId {
        self.waypoint
    }

    /// Key columns
    pub fn keys(&self) -> &[(SlotId, DataType)] {
        &self.keys
    }

    /// Payload columns
    pub fn payload(&self) -> &[(SlotId, DataType)] {
        &self.payload
    }

    /// Insert every tuple live for `queries`.
    ///
    /// Records are bucketed per segment first; then segments are checked out
    /// one at a time in whatever order they become free.
    pub fn insert_chunk(
        &self,
        table: &SegmentedHashTable,
        chunk: &Chunk,
        queries: QueryIdSet,
        test_probes: usize,
        max_fill_rate: f64,
        rng: &mut impl Rng,
    ) -> Result<JoinBuildResult> {
        let geometry = table.geometry();
        let mut buckets: Vec<Vec<(u64, Vec<u8>)>> = vec![Vec::new(); geometry.num_segments()];
        let mut pending: SegmentMask = 0;

        let key_slots: Vec<SlotId> = self.keys.iter().map(|(s, _)| *s).collect();
        let key_columns = key_slots
            .iter()
            .map(|&s| chunk.require_column(s))
            .collect::<Result<Vec<_>>>()?;
        let payload_columns = self
            .payload
            .iter()
            .map(|(s, _)| chunk.require_column(*s))
            .collect::<Result<Vec<_>>>()?;

        for (tuple, mask) in chunk.bitstring().iter().enumerate() {
            let live = mask.intersect(queries);
            if live.is_empty() {
                continue;
            }
            let key = chunk.row(tuple, &key_slots)?;
            let hash = hash_key(&key);

            let mut record = RecordBuilder::new(live);
            let mut buf = Vec::new();
            for (field, column) in key_columns.iter().chain(payload_columns.iter()).enumerate() {
                if column.is_null(tuple) {
                    continue;
                }
                buf.clear();
                column.encode_value(tuple, &mut buf)?;
                record.field(field as SlotId, &buf)?;
            }

            let segment = geometry.address(hash).segment;
            buckets[segment].push((hash, record.finish()));
            pending |= 1 << segment;
        }

        let mut result = JoinBuildResult::default();
        while pending != 0 {
            let mut guard = table.checkout_one(pending)?;
            let segment = guard.index();
            for (hash, record) in buckets[segment].drain(..) {
                guard.insert(hash, self.waypoint, &record)?;
                result.inserted += 1;
            }
            let sample = guard.sample_fill(rng, test_probes);
            guard.checkin();
            pending &= !(1 << segment);

            if sample.fill_rate() >= max_fill_rate {
                tracing::warn!(
                    waypoint = %self.waypoint,
                    segment,
                    fill = sample.fill_rate(),
                    "join segment overfull"
                );
                result.overfull.push(segment);
            }
            result.samples.push((segment, sample));
        }
        Ok(result)
    }
}
