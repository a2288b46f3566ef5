//! Join records moved out of the table by the cleaner

use super::cleaner::SpillSink;
use super::segment::EvictedRecord;
use crate::chunk::WaypointId;
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Spilled records of one join, by hash
#[derive(Debug, Clone, Default)]
pub struct SpilledRecords {
    by_hash: HashMap<u64, Vec<Vec<u8>>>,
    len: usize,
}

impl SpilledRecords {
    /// Records spilled under exactly `hash`, in spill order
    pub fn probe(&self, hash: u64) -> impl Iterator<Item = &[u8]> {
        self.by_hash.get(&hash).into_iter().flatten().map(Vec::as_slice)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing was spilled
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Spilled join records shared by the cleaner and the probe side.
///
/// A probe holds an `Arc` snapshot of one join's records. Spilling copies the
/// join's records before appending, so a snapshot never changes under its
/// reader.
#[derive(Debug, Default)]
pub struct SpillStore {
    joins: RwLock<HashMap<WaypointId, Arc<SpilledRecords>>>,
}

impl SpillStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records spilled for `waypoint`
    pub fn records(&self, waypoint: WaypointId) -> Option<Arc<SpilledRecords>> {
        self.joins.read().get(&waypoint).cloned()
    }

    /// Drop every record of `waypoint`; returns how many there were
    pub fn remove(&self, waypoint: WaypointId) -> usize {
        self.joins.write().remove(&waypoint).map_or(0, |r| r.len)
    }

    /// Records held across all joins
    pub fn len(&self) -> usize {
        self.joins.read().values().map(|r| r.len).sum()
    }

    /// True when no join has spilled records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpillSink for &SpillStore {
    fn spill(&mut self, _segment: usize, records: Vec<EvictedRecord>) -> Result<()> {
        let mut joins = self.joins.write();
        for evicted in records {
            let join = Arc::make_mut(joins.entry(evicted.waypoint).or_default());
            join.by_hash.entry(evicted.hash).or_default().push(evicted.record);
            join.len += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evicted(hash: u64, waypoint: u32, byte: u8) -> EvictedRecord {
        EvictedRecord {
            hash,
            waypoint: WaypointId(waypoint),
            record: vec![byte],
        }
    }

    #[test]
    fn test_spilled_records_by_hash() {
        let store = SpillStore::new();
        let mut sink = &store;
        sink.spill(0, vec![evicted(7, 1, 1), evicted(7, 1, 2), evicted(9, 1, 3), evicted(7, 2, 4)])
            .unwrap();

        let join = store.records(WaypointId(1)).unwrap();
        assert_eq!(join.len(), 3);
        assert_eq!(join.probe(7).collect::<Vec<_>>(), vec![&[1u8][..], &[2u8][..]]);
        assert_eq!(join.probe(8).count(), 0);
        assert_eq!(store.len(), 4);
        assert!(store.records(WaypointId(3)).is_none());
    }

    #[test]
    fn test_snapshot_unchanged_by_later_spill() {
        let store = SpillStore::new();
        let mut sink = &store;
        sink.spill(0, vec![evicted(1, 1, 1)]).unwrap();
        let before = store.records(WaypointId(1)).unwrap();
        sink.spill(1, vec![evicted(1, 1, 2)]).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(store.records(WaypointId(1)).unwrap().len(), 2);
        assert_eq!(store.remove(WaypointId(1)), 2);
        assert!(store.is_empty());
        assert_eq!(store.remove(WaypointId(1)), 0);
    }
}
