//! Write-back of overfull segments on the reserved cleaner budget

use super::segment::{EvictedRecord, SegmentSample};
use super::table::SegmentedHashTable;
use crate::chunk::WaypointId;
use crate::error::{Error, Result};
use crate::tokens::{DiskHoard, TokenKind, TokenPool, WorkToken};
use std::collections::BTreeMap;

/// What the cleaner would evict from one segment
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EvictionAdvice {
    /// Segment index
    pub segment: usize,
    /// Sampled fill rate that triggered the advice
    pub sampled_fill: f64,
    /// Owning waypoints ranked by sampled collisions, most first
    pub ranked: Vec<(WaypointId, usize)>,
}

/// Outcome of a cleaning pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanReport {
    /// Segments visited
    pub segments: usize,
    /// Records handed to the spill sink
    pub evicted: usize,
}

/// Destination for evicted records
pub trait SpillSink: Send {
    /// Take ownership of records evicted from `segment`
    fn spill(&mut self, segment: usize, records: Vec<EvictedRecord>) -> Result<()>;
}

/// Evicts join records from crowded segments.
///
/// The cleaner draws CPU and disk tokens from the reserve in [`TokenPool`], so
/// readers holding every regular token cannot block write-back.
#[derive(Debug)]
pub struct Cleaner {
    clean_fill_rate: f64,
    tokens: TokenPool,
    hoard: DiskHoard,
}

impl Cleaner {
    /// Cleaner that evicts down to `clean_fill_rate`
    pub fn new(clean_fill_rate: f64, tokens: TokenPool, hoard_limit: usize) -> Self {
        Self {
            clean_fill_rate,
            tokens,
            hoard: DiskHoard::new(hoard_limit),
        }
    }

    /// Target fill ratio after cleaning
    pub fn clean_fill_rate(&self) -> f64 {
        self.clean_fill_rate
    }

    /// Grab free cleaner disk tokens ahead of a write-back. Returns how many
    /// are hoarded afterwards.
    pub fn hoard_disk_tokens(&self) -> usize {
        while let Some(token) = self.tokens.try_acquire_cleaner(TokenKind::Disk) {
            if self.hoard.hoard(token).is_err() {
                break;
            }
        }
        self.hoard.len()
    }

    /// Give every hoarded disk token back to its pool
    pub fn release_hoard(&self) -> usize {
        let mut released = 0;
        while let Some(token) = self.hoard.hand_to_writer() {
            drop(token);
            released += 1;
        }
        released
    }

    /// Turn per-segment samples into eviction advice for segments whose
    /// merged sample is at or above `max_fill_rate`
    pub fn advise(&self, samples: &[(usize, SegmentSample)], max_fill_rate: f64) -> Vec<EvictionAdvice> {
        let mut merged: BTreeMap<usize, SegmentSample> = BTreeMap::new();
        for (segment, sample) in samples {
            merged.entry(*segment).or_default().merge(sample.clone());
        }
        merged
            .into_iter()
            .filter(|(_, s)| s.fill_rate() >= max_fill_rate)
            .map(|(segment, sample)| EvictionAdvice {
                segment,
                sampled_fill: sample.fill_rate(),
                ranked: sample.collisions_by_waypoint(),
            })
            .collect()
    }

    fn require_cpu_reserve(token: &WorkToken) -> Result<()> {
        if token.is_cleaner() && token.kind() == TokenKind::Cpu {
            Ok(())
        } else {
            Err(Error::token(format!("cleaner work needs a reserved CPU token, got {token:?}")))
        }
    }

    fn disk_token(&self) -> Result<WorkToken> {
        match self.hoard.hand_to_writer() {
            Some(token) => Ok(token),
            None => self.tokens.acquire_cleaner(TokenKind::Disk),
        }
    }

    /// Reserved CPU token for a cleaning or purge pass
    pub fn acquire_cpu(&self) -> Result<WorkToken> {
        self.tokens.acquire_cleaner(TokenKind::Cpu)
    }

    /// Evict the advised waypoints from each segment, most colliding first,
    /// until the segment is at or below the clean fill rate.
    ///
    /// `cpu` must come from the cleaner reserve.
    pub fn clean(
        &self,
        table: &SegmentedHashTable,
        advice: &[EvictionAdvice],
        sink: &mut dyn SpillSink,
        cpu: &WorkToken,
    ) -> Result<CleanReport> {
        Self::require_cpu_reserve(cpu)?;
        let mut report = CleanReport::default();
        for item in advice {
            let order: Vec<WaypointId> = item.ranked.iter().map(|(w, _)| *w).collect();
            let mut guard = table.checkout_one(1 << item.segment)?;
            let target = self.clean_fill_rate;
            let evicted = guard.evict_while(&order, |ratio| ratio > target);
            let fill = guard.fill_ratio();
            guard.checkin();

            report.segments += 1;
            if evicted.is_empty() {
                continue;
            }
            tracing::warn!(
                segment = item.segment,
                evicted = evicted.len(),
                fill,
                "cleaner evicted join records"
            );
            report.evicted += evicted.len();
            let _disk = self.disk_token()?;
            sink.spill(item.segment, evicted)?;
        }
        Ok(report)
    }

    /// Drop every record of a finished join from the table
    pub fn purge_waypoint(
        &self,
        table: &SegmentedHashTable,
        waypoint: WaypointId,
        cpu: &WorkToken,
    ) -> Result<usize> {
        Self::require_cpu_reserve(cpu)?;
        let mut purged = 0;
        for segment in 0..table.geometry().num_segments() {
            let mut guard = table.checkout_one(1 << segment)?;
            purged += guard.evict(&[waypoint]).len();
        }
        tracing::debug!(%waypoint, purged, "purged join records");
        Ok(purged)
    }
}
