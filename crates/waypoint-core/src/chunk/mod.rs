//! Chunks, columns and query bitstrings
//!
//! A [`Chunk`] is the unit of work in the engine: a batch of tuples stored
//! column-wise, addressed by [`SlotId`], plus a bitstring column recording for
//! each tuple the [`QueryIdSet`] of running queries it is live for.

mod batch;
mod column;
mod compact;
mod query;
mod value;
mod wire;

pub use batch::{Chunk, ChunkBuilder, SlotId};
pub use column::{Column, ColumnData, ColumnValue};
pub use compact::compact;
pub use query::{MAX_QUERIES, QueryExit, QueryId, QueryIdIter, QueryIdSet, WaypointId};
pub use value::{DataType, Value};
