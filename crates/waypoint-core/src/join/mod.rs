//! Join waypoints over the central hash table
//!
//! A join is split in two waypoints. The build side ([`JoinRhs`]) writes one
//! record per live right tuple, tagged with the tuple's query bitstring. Once
//! every build chunk is in, the probe side ([`JoinLhs`]) matches left tuples
//! against a [`TableView`](crate::hash::TableView) snapshot. A match only
//! counts for the queries both tuples are live for.

mod lhs;
mod rhs;

pub use lhs::{JoinLhs, JoinQueries};
pub use rhs::{JoinBuildResult, JoinRhs};
