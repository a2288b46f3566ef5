//! Checkout / checkin protocol over the table's segments

use super::segment::HashSegment;
use super::view::TableView;
use super::{SegmentGeometry, SegmentMask};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing checkout traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TableStats {
    /// Successful checkouts
    pub checkouts: u64,
    /// Passes over the candidate list (one per wakeup)
    pub scans: u64,
    /// Times a caller blocked on the condition variable
    pub waits: u64,
    /// Reader views issued
    pub views: u64,
    /// Forced wakeups broadcast through [`SegmentedHashTable::notify_waiters`]
    pub forced_wakeups: u64,
    /// Current table version; bumped on every checkin
    pub version: u64,
}

#[derive(Default)]
struct Counters {
    checkouts: AtomicU64,
    scans: AtomicU64,
    waits: AtomicU64,
    views: AtomicU64,
    forced_wakeups: AtomicU64,
}

struct TableState {
    /// `None` while the segment is checked out
    segments: Vec<Option<Arc<HashSegment>>>,
    checked_out: SegmentMask,
    readers_waiting: usize,
    version: u64,
}

/// The central join index.
///
/// Segment state is `Free -> CheckedOut -> Free`. Only the thread holding a
/// [`SegmentGuard`] can mutate that segment; the table mutex is held only
/// while segments change hands, never while records are written.
///
/// A thread must not call [`checkout_one`](Self::checkout_one) or
/// [`enter_reader`](Self::enter_reader) while it still holds a guard.
pub struct SegmentedHashTable {
    geometry: SegmentGeometry,
    state: Mutex<TableState>,
    changed: Condvar,
    counters: Counters,
}

impl SegmentedHashTable {
    /// Create an empty table
    pub fn new(geometry: SegmentGeometry) -> Self {
        let segments = (0..geometry.num_segments())
            .map(|_| Some(Arc::new(HashSegment::new(geometry.slot_bits()))))
            .collect();
        tracing::debug!(
            segments = geometry.num_segments(),
            slot_bits = geometry.slot_bits(),
            "created segmented hash table"
        );
        Self {
            geometry,
            state: Mutex::new(TableState {
                segments,
                checked_out: 0,
                readers_waiting: 0,
                version: 0,
            }),
            changed: Condvar::new(),
            counters: Counters::default(),
        }
    }

    /// Table geometry
    pub fn geometry(&self) -> SegmentGeometry {
        self.geometry
    }

    fn candidates(&self, mask: SegmentMask) -> Result<Vec<usize>> {
        let allowed = mask & self.geometry.all_segments();
        if allowed == 0 {
            return Err(Error::hash_table(format!(
                "candidate mask {mask:#x} selects no segment of {}",
                self.geometry.num_segments()
            )));
        }
        Ok((0..self.geometry.num_segments())
            .filter(|i| allowed & (1 << i) != 0)
            .collect())
    }

    /// Check out one free segment from `mask`, blocking until one is free.
    ///
    /// Candidates are scanned in random order so concurrent writers spread
    /// over the table. Pending readers are served before new checkouts.
    pub fn checkout_one(&self, mask: SegmentMask) -> Result<SegmentGuard<'_>> {
        let mut candidates = self.candidates(mask)?;
        let mut rng = rand::thread_rng();
        let mut state = self.state.lock();
        loop {
            self.counters.scans.fetch_add(1, Ordering::Relaxed);
            if state.readers_waiting == 0 {
                candidates.shuffle(&mut rng);
                if let Some(&index) = candidates.iter().find(|&&i| state.segments[i].is_some()) {
                    let shared = state.segments[index].take();
                    state.checked_out |= 1 << index;
                    drop(state);
                    return Ok(self.hand_out(index, shared));
                }
            }
            self.counters.waits.fetch_add(1, Ordering::Relaxed);
            self.changed.wait(&mut state);
        }
    }

    /// Non-blocking variant of [`checkout_one`](Self::checkout_one)
    pub fn try_checkout_one(&self, mask: SegmentMask) -> Result<Option<SegmentGuard<'_>>> {
        let mut candidates = self.candidates(mask)?;
        let mut state = self.state.lock();
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        if state.readers_waiting > 0 {
            return Ok(None);
        }
        candidates.shuffle(&mut rand::thread_rng());
        let Some(&index) = candidates.iter().find(|&&i| state.segments[i].is_some()) else {
            return Ok(None);
        };
        let shared = state.segments[index].take();
        state.checked_out |= 1 << index;
        drop(state);
        Ok(Some(self.hand_out(index, shared)))
    }

    fn hand_out(&self, index: usize, shared: Option<Arc<HashSegment>>) -> SegmentGuard<'_> {
        self.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        // a reader view may still share the segment; copy in that case
        let segment = shared
            .map(Arc::unwrap_or_clone)
            .unwrap_or_else(|| HashSegment::new(self.geometry.slot_bits()));
        tracing::trace!(segment = index, "segment checked out");
        SegmentGuard {
            table: self,
            index,
            segment,
        }
    }

    fn checkin(&self, index: usize, segment: HashSegment) {
        let mut state = self.state.lock();
        state.segments[index] = Some(Arc::new(segment));
        state.checked_out &= !(1 << index);
        state.version += 1;
        drop(state);
        self.changed.notify_all();
        tracing::trace!(segment = index, "segment checked in");
    }

    /// Take a consistent snapshot of every segment.
    ///
    /// Blocks until no segment is checked out. While waiting, new checkouts
    /// are held back so a steady stream of writers cannot starve the reader.
    pub fn enter_reader(&self) -> TableView {
        let mut state = self.state.lock();
        state.readers_waiting += 1;
        while state.checked_out != 0 {
            self.counters.waits.fetch_add(1, Ordering::Relaxed);
            self.changed.wait(&mut state);
        }
        state.readers_waiting -= 1;
        let segments = state.segments.iter().flatten().cloned().collect();
        let version = state.version;
        drop(state);
        // writers parked behind this reader may proceed
        self.changed.notify_all();
        self.counters.views.fetch_add(1, Ordering::Relaxed);
        TableView::new(version, self.geometry, segments)
    }

    /// Wake every blocked caller. Each rescans once and blocks again if
    /// nothing changed.
    pub fn notify_waiters(&self) {
        self.counters.forced_wakeups.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_all();
    }

    /// Indices of free segments whose exact fill ratio is at or above `rate`
    pub fn check_overfull(&self, rate: f64) -> Vec<usize> {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|s| s.fill_ratio() >= rate).map(|_| i))
            .collect()
    }

    /// Segments currently checked out
    pub fn checked_out(&self) -> SegmentMask {
        self.state.lock().checked_out
    }

    /// Counter snapshot
    pub fn stats(&self) -> TableStats {
        let version = self.state.lock().version;
        TableStats {
            checkouts: self.counters.checkouts.load(Ordering::Relaxed),
            scans: self.counters.scans.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            views: self.counters.views.load(Ordering::Relaxed),
            forced_wakeups: self.counters.forced_wakeups.load(Ordering::Relaxed),
            version,
        }
    }
}

impl std::fmt::Debug for SegmentedHashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedHashTable")
            .field("geometry", &self.geometry)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive write access to one segment; checks the segment in on drop
pub struct SegmentGuard<'a> {
    table: &'a SegmentedHashTable,
    index: usize,
    segment: HashSegment,
}

impl SegmentGuard<'_> {
    /// Index of the held segment
    pub fn index(&self) -> usize {
        self.index
    }

    /// Swap in a rebuilt segment, returning the old contents
    pub fn replace(&mut self, segment: HashSegment) -> HashSegment {
        std::mem::replace(&mut self.segment, segment)
    }

    /// Return the segment to the table
    pub fn checkin(self) {}
}

impl Deref for SegmentGuard<'_> {
    type Target = HashSegment;

    fn deref(&self) -> &HashSegment {
        &self.segment
    }
}

impl DerefMut for SegmentGuard<'_> {
    fn deref_mut(&mut self) -> &mut HashSegment {
        &mut self.segment
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        let segment = std::mem::replace(&mut self.segment, HashSegment::new(0));
        self.table.checkin(self.index, segment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{QueryIdSet, WaypointId};
    use crate::hash::RecordBuilder;
    use std::thread;
    use std::time::Duration;

    fn table(segments: usize) -> SegmentedHashTable {
        SegmentedHashTable::new(SegmentGeometry::new(segments, 6).unwrap())
    }

    #[test]
    fn test_checkout_respects_mask() {
        let table = table(4);
        let guard = table.checkout_one(0b0100).unwrap();
        assert_eq!(guard.index(), 2);
        assert_eq!(table.checked_out(), 0b0100);
        assert!(table.try_checkout_one(0b0100).unwrap().is_none());
        let other = table.try_checkout_one(0b0110).unwrap().unwrap();
        assert_eq!(other.index(), 1);
        drop(other);
        guard.checkin();
        assert_eq!(table.checked_out(), 0);
        assert!(table.checkout_one(0b1_0000).is_err());
    }

    #[test]
    fn test_writes_visible_after_checkin() {
        let table = table(2);
        let mut guard = table.checkout_one(0b01).unwrap();
        let record = RecordBuilder::new(QueryIdSet::from_bits(1)).finish();
        guard.insert(42, WaypointId(1), &record).unwrap();
        drop(guard);

        let view = table.enter_reader();
        assert_eq!(view.version(), 1);
        assert_eq!(view.segment(0).map(|s| s.len()), Some(1));
    }

    #[test]
    fn test_view_is_a_snapshot() {
        let table = table(1);
        let view = table.enter_reader();
        let mut guard = table.checkout_one(1).unwrap();
        let record = RecordBuilder::new(QueryIdSet::from_bits(1)).finish();
        guard.insert(7, WaypointId(1), &record).unwrap();
        guard.checkin();
        assert_eq!(view.segment(0).map(|s| s.len()), Some(0));
        assert_eq!(table.enter_reader().segment(0).map(|s| s.len()), Some(1));
    }

    #[test]
    fn test_blocked_checkout_resumes_on_checkin() {
        let table = Arc::new(table(1));
        let guard = table.checkout_one(1).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let g = table.checkout_one(1).unwrap();
                g.index()
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert_eq!(waiter.join().unwrap(), 0);
        assert!(table.stats().waits >= 1);
    }

    #[test]
    fn test_reader_waits_for_writers() {
        let table = Arc::new(table(2));
        let guard = table.checkout_one(0b01).unwrap();
        let reader = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.enter_reader().version())
        };
        thread::sleep(Duration::from_millis(50));
        // the pending reader holds back new checkouts
        assert!(table.try_checkout_one(0b10).unwrap().is_none());
        drop(guard);
        assert_eq!(reader.join().unwrap(), 1);
        assert!(table.try_checkout_one(0b10).unwrap().is_some());
    }

    #[test]
    fn test_check_overfull() {
        let table = table(2);
        let mut guard = table.checkout_one(0b10).unwrap();
        let record = RecordBuilder::new(QueryIdSet::from_bits(1)).finish();
        for h in 0..60u64 {
            guard.insert(h, WaypointId(3), &record).unwrap();
        }
        drop(guard);
        assert_eq!(table.check_overfull(0.7), vec![1]);
        assert!(table.check_overfull(0.99).is_empty());
    }
}
