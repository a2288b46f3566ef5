//! One shard of the central join table

use super::record::RecordView;
use crate::chunk::{QueryIdSet, WaypointId};
use crate::error::{Error, Result};
use rand::Rng;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    hash: u64,
    waypoint: WaypointId,
    offset: usize,
    len: usize,
}

/// A fixed-capacity slot array plus the arena holding serialized records.
///
/// Collisions chain linearly to the next free slot (wrapping). A lookup walks
/// the occupied run starting at the home slot.
#[derive(Debug, Clone)]
pub struct HashSegment {
    slot_mask: usize,
    slots: Vec<Option<SlotEntry>>,
    arena: Vec<u8>,
    occupied: usize,
}

/// Record found by a probe
#[derive(Debug, Clone, Copy)]
pub struct ProbeHit<'a> {
    /// Join waypoint that inserted the record
    pub waypoint: WaypointId,
    /// The serialized record
    pub record: &'a [u8],
}

/// Collisions observed while sampling a segment's fill rate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentSample {
    /// Random slots probed
    pub probes: usize,
    /// Owner and bitstring of every occupied slot hit by a probe
    pub collisions: Vec<(WaypointId, QueryIdSet)>,
}

impl SegmentSample {
    /// Sampled fill rate (collisions / probes)
    pub fn fill_rate(&self) -> f64 {
        if self.probes == 0 {
            0.0
        } else {
            self.collisions.len() as f64 / self.probes as f64
        }
    }

    /// Fold another sample of the same segment into this one
    pub fn merge(&mut self, other: SegmentSample) {
        self.probes += other.probes;
        self.collisions.extend(other.collisions);
    }

    /// Waypoints ranked by sampled collisions, most first
    pub fn collisions_by_waypoint(&self) -> Vec<(WaypointId, usize)> {
        let mut counts: HashMap<WaypointId, usize> = HashMap::new();
        for (waypoint, _) in &self.collisions {
            *counts.entry(*waypoint).or_default() += 1;
        }
        let mut ranked: Vec<_> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }
}

/// A record removed from a segment by the cleaner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedRecord {
    /// Hash the record was stored under
    pub hash: u64,
    /// Owning join waypoint
    pub waypoint: WaypointId,
    /// Serialized record
    pub record: Vec<u8>,
}

impl HashSegment {
    /// Empty segment with `1 << slot_bits` slots
    pub fn new(slot_bits: u32) -> Self {
        let slots = 1usize << slot_bits;
        Self {
            slot_mask: slots - 1,
            slots: vec![None; slots],
            arena: Vec::new(),
            occupied: 0,
        }
    }

    /// Slot capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Records stored
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// True when no record is stored
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Exact occupancy ratio
    pub fn fill_ratio(&self) -> f64 {
        self.occupied as f64 / self.slots.len() as f64
    }

    /// Bytes held by the record arena
    pub fn arena_bytes(&self) -> usize {
        self.arena.len()
    }

    /// Store a record under `hash`. Fails only when every slot is taken.
    pub fn insert(&mut self, hash: u64, waypoint: WaypointId, record: &[u8]) -> Result<()> {
        if self.occupied == self.slots.len() {
            return Err(Error::hash_table(format!(
                "segment exhausted: all {} slots occupied",
                self.slots.len()
            )));
        }
        let mut pos = hash as usize & self.slot_mask;
        while self.slots[pos].is_some() {
            pos = (pos + 1) & self.slot_mask;
        }
        let offset = self.arena.len();
        self.arena.extend_from_slice(record);
        self.slots[pos] = Some(SlotEntry {
            hash,
            waypoint,
            offset,
            len: record.len(),
        });
        self.occupied += 1;
        Ok(())
    }

    /// Records stored under exactly `hash`, in chain order
    pub fn probe(&self, hash: u64) -> Probe<'_> {
        Probe {
            segment: self,
            hash,
            pos: hash as usize & self.slot_mask,
            remaining: self.slots.len(),
        }
    }

    /// Estimate the fill rate by probing `probes` random slots
    pub fn sample_fill(&self, rng: &mut impl Rng, probes: usize) -> SegmentSample {
        let mut sample = SegmentSample {
            probes,
            collisions: Vec::new(),
        };
        for _ in 0..probes {
            let pos = rng.gen_range(0..self.slots.len());
            if let Some(entry) = self.slots[pos] {
                // a record that fails to parse still counts as a collision
                let bits = RecordView::parse(self.bytes(&entry))
                    .map(|r| r.bitstring())
                    .unwrap_or_default();
                sample.collisions.push((entry.waypoint, bits));
            }
        }
        sample
    }

    /// Remove every record owned by a waypoint in `waypoints` and compact
    pub fn evict(&mut self, waypoints: &[WaypointId]) -> Vec<EvictedRecord> {
        self.evict_while(waypoints, |_| true)
    }

    /// Evict owners in the order given until `keep_going` says stop.
    ///
    /// `keep_going` sees the fill ratio the segment would have after the
    /// evictions so far.
    pub fn evict_while(
        &mut self,
        waypoints: &[WaypointId],
        mut keep_going: impl FnMut(f64) -> bool,
    ) -> Vec<EvictedRecord> {
        let mut evict_set = Vec::new();
        let mut remaining = self.occupied;
        for waypoint in waypoints {
            if !keep_going(remaining as f64 / self.slots.len() as f64) {
                break;
            }
            let owned = self
                .slots
                .iter()
                .flatten()
                .filter(|e| e.waypoint == *waypoint)
                .count();
            remaining -= owned;
            evict_set.push(*waypoint);
        }
        if evict_set.is_empty() {
            return Vec::new();
        }

        let old_slots = std::mem::replace(&mut self.slots, vec![None; self.slot_mask + 1]);
        let old_arena = std::mem::take(&mut self.arena);
        self.occupied = 0;

        let mut evicted = Vec::new();
        for entry in old_slots.into_iter().flatten() {
            let bytes = &old_arena[entry.offset..entry.offset + entry.len];
            if evict_set.contains(&entry.waypoint) {
                evicted.push(EvictedRecord {
                    hash: entry.hash,
                    waypoint: entry.waypoint,
                    record: bytes.to_vec(),
                });
            } else {
                // capacity cannot be exceeded: survivors fit before
                let _ = self.insert(entry.hash, entry.waypoint, bytes);
            }
        }
        evicted
    }

    fn bytes(&self, entry: &SlotEntry) -> &[u8] {
        &self.arena[entry.offset..entry.offset + entry.len]
    }
}

/// Iterator over the records matching one hash
pub struct Probe<'a> {
    segment: &'a HashSegment,
    hash: u64,
    pos: usize,
    remaining: usize,
}

impl<'a> Iterator for Probe<'a> {
    type Item = ProbeHit<'a>;

    fn next(&mut self) -> Option<ProbeHit<'a>> {
        while self.remaining > 0 {
            let entry = self.segment.slots[self.pos]?;
            self.pos = (self.pos + 1) & self.segment.slot_mask;
            self.remaining -= 1;
            if entry.hash == self.hash {
                return Some(ProbeHit {
                    waypoint: entry.waypoint,
                    record: self.segment.bytes(&entry),
                });
            }
        }
        None
    }
}
