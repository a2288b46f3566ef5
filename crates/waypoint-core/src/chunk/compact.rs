//! Compaction: drop tuples no longer live for any requested query

use super::batch::Chunk;
use super::query::QueryIdSet;
use crate::error::Result;

/// Keep only tuples whose mask intersects `queries`; the surviving masks are
/// narrowed to `queries`.
///
/// A chunk that is dense for every query in `queries` is returned as-is, with
/// its columns and bitstring untouched.
pub fn compact(mut chunk: Chunk, queries: QueryIdSet) -> Result<Chunk> {
    if !queries.is_empty() && chunk.is_dense_for(queries) {
        return Ok(chunk);
    }

    let keep: Vec<usize> = chunk
        .bitstring()
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.overlaps(queries).then_some(i))
        .collect();
    let bitstring: Vec<_> = keep
        .iter()
        .map(|&i| chunk.bitstring()[i].intersect(queries))
        .collect();

    if keep.len() == chunk.num_tuples() {
        chunk.swap_bitstring(bitstring)?;
        return Ok(chunk);
    }

    let sequence = chunk.sequence();
    let slots: Vec<_> = chunk.slots().collect();
    let mut columns = Vec::with_capacity(slots.len());
    for slot in slots {
        columns.push((slot, chunk.require_column(slot)?.take(&keep)?));
    }
    Ok(Chunk::new(columns, bitstring)?.with_sequence(sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Column, QueryId};
    use std::sync::Arc;

    fn mask(ids: &[usize]) -> QueryIdSet {
        ids.iter().map(|&i| QueryId::new(i).unwrap()).collect()
    }

    #[test]
    fn test_dense_chunk_passes_through_untouched() {
        let chunk = Chunk::new(
            vec![(0, Column::from(vec![1i64, 2, 3]))],
            vec![mask(&[0, 1]), mask(&[0, 1, 2]), mask(&[0, 1])],
        )
        .unwrap();
        let column = chunk.column_arc(0).unwrap().clone();

        let out = compact(chunk, mask(&[1])).unwrap();
        assert!(Arc::ptr_eq(out.column_arc(0).unwrap(), &column));
        // masks are not narrowed on the pass-through path
        assert_eq!(out.bitstring()[1], mask(&[0, 1, 2]));
    }

    #[test]
    fn test_drops_tuples_dead_for_every_query() {
        let chunk = Chunk::new(
            vec![(0, Column::from(vec![10i64, 20, 30, 40]))],
            vec![mask(&[0]), mask(&[1]), mask(&[0, 2]), mask(&[2])],
        )
        .unwrap()
        .with_sequence(9);

        let out = compact(chunk, mask(&[0, 1])).unwrap();
        assert_eq!(out.num_tuples(), 3);
        assert_eq!(out.column(0).unwrap().as_slice::<i64>().unwrap(), &[10, 20, 30]);
        assert_eq!(out.bitstring(), &[mask(&[0]), mask(&[1]), mask(&[0])]);
        assert_eq!(out.sequence(), 9);
    }

    #[test]
    fn test_all_survive_shares_columns() {
        let chunk = Chunk::new(
            vec![(0, Column::from(vec![1i64, 2]))],
            vec![mask(&[0, 3]), mask(&[1])],
        )
        .unwrap();
        let column = chunk.column_arc(0).unwrap().clone();
        let out = compact(chunk, mask(&[0, 1])).unwrap();
        assert!(Arc::ptr_eq(out.column_arc(0).unwrap(), &column));
        assert_eq!(out.bitstring(), &[mask(&[0]), mask(&[1])]);
    }

    #[test]
    fn test_empty_query_set_drops_everything() {
        let chunk = Chunk::uniform(vec![(0, Column::from(vec![1i64, 2]))], mask(&[0])).unwrap();
        let out = compact(chunk, QueryIdSet::EMPTY).unwrap();
        assert!(out.is_empty());
        assert_eq!(out.column(0).unwrap().len(), 0);
    }
}
