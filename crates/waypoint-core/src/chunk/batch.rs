//! Chunks: columnar tuple batches plus a per-tuple query bitstring

use super::column::Column;
use super::query::QueryIdSet;
use super::value::{DataType, Value};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Column position inside a chunk. Columns are addressed by slot, not name.
pub type SlotId = u16;

/// A batch of tuples stored column-wise.
///
/// Data columns are reference counted: cloning a chunk shares the columns and
/// copies only the bitstring. Swapping a column out of a chunk whose column is
/// not shared elsewhere moves it without copying.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    columns: Vec<Option<Arc<Column>>>,
    bitstring: Vec<QueryIdSet>,
    dense: QueryIdSet,
    sequence: u64,
}

impl Chunk {
    /// Build a chunk from slotted columns and the bitstring column
    pub fn new(columns: Vec<(SlotId, Column)>, bitstring: Vec<QueryIdSet>) -> Result<Self> {
        let mut chunk = Self {
            columns: Vec::new(),
            dense: dense_of(&bitstring),
            bitstring,
            sequence: 0,
        };
        for (slot, column) in columns {
            chunk.put_column(slot, column)?;
        }
        Ok(chunk)
    }

    /// Build a chunk whose tuples all carry the same query set
    pub fn uniform(columns: Vec<(SlotId, Column)>, queries: QueryIdSet) -> Result<Self> {
        let num_tuples = columns.first().map_or(0, |(_, c)| c.len());
        Self::new(columns, vec![queries; num_tuples])
    }

    /// Assign the producer sequence number
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Producer sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of tuples
    pub fn num_tuples(&self) -> usize {
        self.bitstring.len()
    }

    /// True when the chunk has no tuples
    pub fn is_empty(&self) -> bool {
        self.bitstring.is_empty()
    }

    /// Per-tuple query bitstring
    pub fn bitstring(&self) -> &[QueryIdSet] {
        &self.bitstring
    }

    /// Queries carried by every tuple
    pub fn dense_queries(&self) -> QueryIdSet {
        self.dense
    }

    /// Union of all tuple masks
    pub fn queries(&self) -> QueryIdSet {
        self.bitstring
            .iter()
            .fold(QueryIdSet::EMPTY, |acc, m| acc.union(*m))
    }

    /// True when every tuple carries every query of `queries`
    pub fn is_dense_for(&self, queries: QueryIdSet) -> bool {
        queries.is_subset_of(self.dense)
    }

    /// Occupied slots, ascending
    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i as SlotId))
    }

    /// Borrow a column
    pub fn column(&self, slot: SlotId) -> Option<&Column> {
        self.columns
            .get(slot as usize)
            .and_then(|c| c.as_deref())
    }

    /// Borrow the shared handle of a column
    pub fn column_arc(&self, slot: SlotId) -> Option<&Arc<Column>> {
        self.columns.get(slot as usize).and_then(|c| c.as_ref())
    }

    /// Fetch a column that must be present
    pub fn require_column(&self, slot: SlotId) -> Result<&Column> {
        self.column(slot)
            .ok_or_else(|| Error::chunk(format!("slot {slot} is empty")))
    }

    /// Move a column out, leaving the slot empty.
    ///
    /// Copies only when another chunk still shares the column.
    pub fn swap_column(&mut self, slot: SlotId) -> Result<Column> {
        let shared = self.take_shared(slot)?;
        Ok(Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone()))
    }

    /// Move the shared handle of a column out, leaving the slot empty
    pub fn take_shared(&mut self, slot: SlotId) -> Result<Arc<Column>> {
        self.columns
            .get_mut(slot as usize)
            .and_then(Option::take)
            .ok_or_else(|| Error::chunk(format!("slot {slot} is empty")))
    }

    /// Install a column at `slot`
    pub fn put_column(&mut self, slot: SlotId, column: Column) -> Result<()> {
        self.put_shared(slot, Arc::new(column))
    }

    /// Install a shared column at `slot`
    pub fn put_shared(&mut self, slot: SlotId, column: Arc<Column>) -> Result<()> {
        if column.len() != self.bitstring.len() {
            return Err(Error::chunk(format!(
                "column for slot {slot} has {} values, chunk has {} tuples",
                column.len(),
                self.bitstring.len()
            )));
        }
        let index = slot as usize;
        if self.columns.len() <= index {
            self.columns.resize(index + 1, None);
        }
        self.columns[index] = Some(column);
        Ok(())
    }

    /// Replace the bitstring column, returning the old one
    pub fn swap_bitstring(&mut self, bitstring: Vec<QueryIdSet>) -> Result<Vec<QueryIdSet>> {
        if bitstring.len() != self.bitstring.len() {
            return Err(Error::chunk(format!(
                "bitstring has {} entries, chunk has {} tuples",
                bitstring.len(),
                self.bitstring.len()
            )));
        }
        self.dense = dense_of(&bitstring);
        Ok(std::mem::replace(&mut self.bitstring, bitstring))
    }

    /// Project one tuple onto `slots`
    pub fn row(&self, tuple: usize, slots: &[SlotId]) -> Result<Vec<Value>> {
        slots
            .iter()
            .map(|&slot| self.require_column(slot)?.value(tuple))
            .collect()
    }
}

fn dense_of(bitstring: &[QueryIdSet]) -> QueryIdSet {
    let mut iter = bitstring.iter();
    match iter.next() {
        Some(first) => iter.fold(*first, |acc, m| acc.intersect(*m)),
        None => QueryIdSet::EMPTY,
    }
}

/// Row-at-a-time chunk construction for stages that synthesize tuples
#[derive(Debug)]
pub struct ChunkBuilder {
    slots: Vec<SlotId>,
    columns: Vec<Column>,
    bitstring: Vec<QueryIdSet>,
}

impl ChunkBuilder {
    /// Builder for the given output schema
    pub fn new(schema: &[(SlotId, DataType)]) -> Self {
        Self {
            slots: schema.iter().map(|(s, _)| *s).collect(),
            columns: schema.iter().map(|(_, dt)| Column::new(*dt)).collect(),
            bitstring: Vec::new(),
        }
    }

    /// Append one tuple. `values` must follow the schema order.
    pub fn push_row(&mut self, values: Vec<Value>, mask: QueryIdSet) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(Error::chunk(format!(
                "row has {} values, schema has {} columns",
                values.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.push(value)?;
        }
        self.bitstring.push(mask);
        Ok(())
    }

    /// Rows appended so far
    pub fn len(&self) -> usize {
        self.bitstring.len()
    }

    /// True when no row was appended
    pub fn is_empty(&self) -> bool {
        self.bitstring.is_empty()
    }

    /// Freeze into a chunk
    pub fn finish(self) -> Result<Chunk> {
        Chunk::new(self.slots.into_iter().zip(self.columns).collect(), self.bitstring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::QueryId;

    fn q(i: usize) -> QueryId {
        QueryId::new(i).unwrap()
    }

    fn mask(ids: &[usize]) -> QueryIdSet {
        ids.iter().map(|&i| q(i)).collect()
    }

    #[test]
    fn test_new_validates_lengths() {
        let err = Chunk::new(vec![(0, Column::from(vec![1i64, 2]))], vec![mask(&[0])]);
        assert!(err.is_err());
    }

    #[test]
    fn test_dense_queries() {
        let chunk = Chunk::new(
            vec![(0, Column::from(vec![1i64, 2, 3]))],
            vec![mask(&[0, 1]), mask(&[0]), mask(&[0, 2])],
        )
        .unwrap();
        assert_eq!(chunk.dense_queries(), mask(&[0]));
        assert_eq!(chunk.queries(), mask(&[0, 1, 2]));
        assert!(chunk.is_dense_for(mask(&[0])));
        assert!(!chunk.is_dense_for(mask(&[0, 1])));
    }

    #[test]
    fn test_swap_column_moves_without_copy() {
        let mut chunk = Chunk::uniform(vec![(2, Column::from(vec![7i64, 8]))], mask(&[0])).unwrap();
        let before = chunk.column(2).unwrap().as_slice::<i64>().unwrap().as_ptr();

        let column = chunk.swap_column(2).unwrap();
        assert_eq!(column.as_slice::<i64>().unwrap().as_ptr(), before);
        assert!(chunk.column(2).is_none());
        assert!(chunk.swap_column(2).is_err());

        let mut out = Chunk::new(vec![], vec![mask(&[0]); 2]).unwrap();
        out.put_column(5, column).unwrap();
        assert_eq!(out.slots().collect::<Vec<_>>(), vec![5]);
        assert_eq!(out.column(5).unwrap().get::<i64>(0).unwrap(), 7);
    }

    #[test]
    fn test_clone_shares_columns_and_swap_copies_when_shared() {
        let mut chunk = Chunk::uniform(vec![(0, Column::from(vec![1i64, 2]))], mask(&[0])).unwrap();
        let copy = chunk.clone();
        assert!(Arc::ptr_eq(chunk.column_arc(0).unwrap(), copy.column_arc(0).unwrap()));

        let moved = chunk.swap_column(0).unwrap();
        assert_eq!(moved.len(), 2);
        // the clone still owns its data
        assert_eq!(copy.column(0).unwrap().get::<i64>(0).unwrap(), 1);
    }

    #[test]
    fn test_builder_round_trip() {
        let mut builder = ChunkBuilder::new(&[(0, DataType::Int64), (1, DataType::Utf8)]);
        builder
            .push_row(vec![Value::Int64(1), Value::from("a")], mask(&[0]))
            .unwrap();
        builder
            .push_row(vec![Value::Null, Value::from("b")], mask(&[1]))
            .unwrap();
        assert!(builder.push_row(vec![Value::Int64(1)], mask(&[0])).is_err());

        let chunk = builder.finish().unwrap();
        assert_eq!(chunk.num_tuples(), 2);
        assert_eq!(chunk.row(1, &[0, 1]).unwrap(), vec![Value::Null, Value::from("b")]);
        assert_eq!(chunk.dense_queries(), QueryIdSet::EMPTY);
    }
}
