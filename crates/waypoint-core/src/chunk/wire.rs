//! Chunk wire shape exchanged with storage and plan layers
//!
//! A chunk on the wire is an ordered list of `(slot_id, column_bytes)` plus
//! the bitstring column. Columns are encoded individually so a consumer can
//! skip slots it does not need.

use super::batch::{Chunk, SlotId};
use super::column::Column;
use super::query::QueryIdSet;
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct ChunkWire {
    sequence: u64,
    columns: Vec<(SlotId, Vec<u8>)>,
    bitstring: Vec<u64>,
}

impl Chunk {
    /// Encode to the wire shape
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let mut columns = Vec::new();
        for slot in self.slots() {
            let column = self.require_column(slot)?;
            columns.push((slot, bincode::serialize(column)?));
        }
        let wire = ChunkWire {
            sequence: self.sequence(),
            columns,
            bitstring: self.bitstring().iter().map(|m| m.bits()).collect(),
        };
        Ok(bincode::serialize(&wire)?)
    }

    /// Decode from the wire shape
    pub fn from_wire(bytes: &[u8]) -> Result<Chunk> {
        let wire: ChunkWire = bincode::deserialize(bytes)?;
        let mut columns = Vec::with_capacity(wire.columns.len());
        for (slot, data) in wire.columns {
            let column: Column = bincode::deserialize(&data)?;
            columns.push((slot, column));
        }
        let bitstring = wire.bitstring.into_iter().map(QueryIdSet::from_bits).collect();
        Ok(Chunk::new(columns, bitstring)?.with_sequence(wire.sequence))
    }
}

#[cfg(test)]
mod tests {
    use crate::chunk::{Chunk, Column, DataType, QueryIdSet, Value};

    #[test]
    fn test_wire_preserves_slots_nulls_and_masks() {
        let mut names = Column::new(DataType::Utf8);
        names.push(Value::from("x")).unwrap();
        names.push_null();
        let chunk = Chunk::new(
            vec![(1, Column::from(vec![1.5f64, 2.5])), (4, names)],
            vec![QueryIdSet::from_bits(0b11), QueryIdSet::from_bits(0b10)],
        )
        .unwrap()
        .with_sequence(42);

        let decoded = Chunk::from_wire(&chunk.to_wire().unwrap()).unwrap();
        assert_eq!(decoded.sequence(), 42);
        assert_eq!(decoded.slots().collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(decoded.bitstring(), chunk.bitstring());
        assert!(decoded.column(4).unwrap().is_null(1));
        assert_eq!(decoded.column(1), chunk.column(1));
    }

    #[test]
    fn test_truncated_wire_is_an_error() {
        let chunk = Chunk::uniform(vec![(0, Column::from(vec![1i64]))], QueryIdSet::from_bits(1)).unwrap();
        let bytes = chunk.to_wire().unwrap();
        assert!(Chunk::from_wire(&bytes[..bytes.len() / 2]).is_err());
    }
}
