//! Segmented hash table shared by every join waypoint
//!
//! The table is split into independently checkable [`HashSegment`]s. A writer
//! checks a segment out, mutates it without holding any lock, then checks it
//! back in. Readers take a versioned [`TableView`] snapshot that is only issued
//! while no segment is out.
//!
//! ```text
//! hash: 64 bits
//! ┌──────────────────────────────┬───────────────┐
//! │ bits above slot_bits         │ slot_bits     │
//! │ → segment (multiply-shift)   │ → slot (mask) │
//! └──────────────────────────────┴───────────────┘
//! ```

mod cleaner;
mod record;
mod segment;
mod spill;
mod table;
mod view;

pub use cleaner::{CleanReport, Cleaner, EvictionAdvice, SpillSink};
pub use record::{FieldIter, RecordBuilder, RecordView};
pub use segment::{EvictedRecord, HashSegment, Probe, ProbeHit, SegmentSample};
pub use spill::{SpillStore, SpilledRecords};
pub use table::{SegmentGuard, SegmentedHashTable, TableStats};
pub use view::TableView;

use crate::chunk::Value;
use crate::config::HashTableConfig;
use crate::error::{Error, Result};
use bytes::BufMut;
use xxhash_rust::xxh3::xxh3_64;

/// Bitmask over segment indices. Segment `i` is allowed when bit `i` is set.
pub type SegmentMask = u64;

/// Segment count and slot width of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGeometry {
    num_segments: usize,
    slot_bits: u32,
}

/// Segment and slot a hash maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashAddress {
    /// Segment index
    pub segment: usize,
    /// Home slot inside the segment
    pub slot: usize,
}

impl SegmentGeometry {
    /// Geometry with `num_segments` segments of `1 << slot_bits` slots
    pub fn new(num_segments: usize, slot_bits: u32) -> Result<Self> {
        if num_segments == 0 || num_segments > 64 {
            return Err(Error::hash_table(format!(
                "segment count {num_segments} outside 1..=64"
            )));
        }
        if !(1..=32).contains(&slot_bits) {
            return Err(Error::hash_table(format!("slot bits {slot_bits} outside 1..=32")));
        }
        Ok(Self {
            num_segments,
            slot_bits,
        })
    }

    /// Geometry described by a table configuration
    pub fn from_config(config: &HashTableConfig) -> Result<Self> {
        Self::new(config.num_segments, config.slot_bits)
    }

    /// Number of segments
    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// log2 of the slots per segment
    pub fn slot_bits(&self) -> u32 {
        self.slot_bits
    }

    /// Mask allowing every segment
    pub fn all_segments(&self) -> SegmentMask {
        if self.num_segments == 64 {
            u64::MAX
        } else {
            (1u64 << self.num_segments) - 1
        }
    }

    /// Map a hash to its segment and home slot
    pub fn address(&self, hash: u64) -> HashAddress {
        let slot = (hash & ((1u64 << self.slot_bits) - 1)) as usize;
        let high = (hash >> self.slot_bits) & 0xFFFF_FFFF;
        let segment = ((high * self.num_segments as u64) >> 32) as usize;
        HashAddress { segment, slot }
    }
}

/// Hash a join key.
///
/// Each value is prefixed with a type tag and its length so that different
/// keys with equal concatenated bytes do not collide systematically.
pub fn hash_key(values: &[Value]) -> u64 {
    let mut buf = Vec::with_capacity(values.len() * 10);
    for value in values {
        let tag = match value {
            Value::Null => 0u8,
            Value::Int64(_) => 1,
            Value::Float64(_) => 2,
            Value::Bool(_) => 3,
            Value::Utf8(_) => 4,
        };
        buf.put_u8(tag);
        let start = buf.len();
        buf.put_u32_le(0);
        value.encode(&mut buf);
        let len = (buf.len() - start - 4) as u32;
        buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
    }
    xxh3_64(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_ranges() {
        let geometry = SegmentGeometry::new(7, 4).unwrap();
        for hash in [0u64, 1, 15, 16, u64::MAX, 0xDEAD_BEEF_0000_1234] {
            let addr = geometry.address(hash);
            assert!(addr.segment < 7);
            assert!(addr.slot < 16);
            assert_eq!(addr.slot, (hash & 15) as usize);
        }
        assert_eq!(geometry.address(u64::MAX).segment, 6);
        assert_eq!(geometry.address(0).segment, 0);
    }

    #[test]
    fn test_all_segments_mask() {
        assert_eq!(SegmentGeometry::new(3, 8).unwrap().all_segments(), 0b111);
        assert_eq!(SegmentGeometry::new(64, 8).unwrap().all_segments(), u64::MAX);
        assert!(SegmentGeometry::new(0, 8).is_err());
        assert!(SegmentGeometry::new(65, 8).is_err());
    }

    #[test]
    fn test_hash_key_distinguishes_types_and_boundaries() {
        assert_eq!(hash_key(&[Value::Int64(5)]), hash_key(&[Value::Int64(5)]));
        assert_ne!(hash_key(&[Value::Int64(5)]), hash_key(&[Value::Float64(5.0)]));
        assert_ne!(
            hash_key(&["ab".into(), "c".into()]),
            hash_key(&["a".into(), "bc".into()])
        );
    }
}
