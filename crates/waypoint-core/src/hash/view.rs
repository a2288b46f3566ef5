use super::SegmentGeometry;
use super::segment::{HashSegment, Probe};
use std::sync::Arc;

/// Read-only snapshot of every segment, tagged with the table version it was
/// taken at. Later checkins do not affect an existing view.
#[derive(Debug, Clone)]
pub struct TableView {
    version: u64,
    geometry: SegmentGeometry,
    segments: Vec<Arc<HashSegment>>,
}

impl TableView {
    pub(super) fn new(version: u64, geometry: SegmentGeometry, segments: Vec<Arc<HashSegment>>) -> Self {
        Self {
            version,
            geometry,
            segments,
        }
    }

    /// Table version the snapshot reflects
    pub fn version(&self) -> u64 {
        self.version
    }

    /// One segment of the snapshot
    pub fn segment(&self, index: usize) -> Option<&HashSegment> {
        self.segments.get(index).map(Arc::as_ref)
    }

    /// Records stored across all segments
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// True when the snapshot holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records stored under `hash`
    pub fn probe(&self, hash: u64) -> Option<Probe<'_>> {
        let address = self.geometry.address(hash);
        self.segments.get(address.segment).map(|s| s.probe(hash))
    }
}
