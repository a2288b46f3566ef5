//! Query identifiers and query bitstrings
//!
//! Every tuple travelling through the engine carries a [`QueryIdSet`]: the
//! set of running queries for which the tuple is still live. Sets are 64-bit
//! bitstrings, so at most [`MAX_QUERIES`] queries run concurrently.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of concurrently running queries
pub const MAX_QUERIES: usize = 64;

/// Identifier of one running query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(u8);

impl QueryId {
    /// Create a query id, rejecting ids outside the bitstring width
    pub fn new(id: usize) -> Result<Self> {
        if id >= MAX_QUERIES {
            return Err(Error::chunk(format!(
                "query id {id} exceeds the {MAX_QUERIES}-query bitstring"
            )));
        }
        Ok(Self(id as u8))
    }

    /// Numeric value of the id
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.0)
    }
}

/// Identifier of a waypoint (operator node) in a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaypointId(pub u32);

impl fmt::Display for WaypointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.0)
    }
}

/// Where a query's results leave the plan: the waypoint whose output is final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryExit {
    /// The query
    pub query: QueryId,
    /// Waypoint producing the query's final output
    pub exit: WaypointId,
}

/// Bitstring over query ids
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryIdSet(u64);

impl QueryIdSet {
    /// The empty set
    pub const EMPTY: QueryIdSet = QueryIdSet(0);

    /// Build a set from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Set containing a single query
    pub fn single(query: QueryId) -> Self {
        Self(1 << query.0)
    }

    /// Set containing the first `n` query ids
    pub fn first_n(n: usize) -> Self {
        if n >= MAX_QUERIES {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    /// Add a query to the set
    pub fn insert(&mut self, query: QueryId) {
        self.0 |= 1 << query.0;
    }

    /// Remove a query from the set
    pub fn remove(&mut self, query: QueryId) {
        self.0 &= !(1 << query.0);
    }

    /// Membership test
    pub fn contains(self, query: QueryId) -> bool {
        self.0 & (1 << query.0) != 0
    }

    /// True when every member of `self` is in `other`
    pub fn is_subset_of(self, other: QueryIdSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// True when the sets share at least one member
    pub fn overlaps(self, other: QueryIdSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Set union
    #[must_use]
    pub fn union(self, other: QueryIdSet) -> Self {
        Self(self.0 | other.0)
    }

    /// Set intersection
    #[must_use]
    pub fn intersect(self, other: QueryIdSet) -> Self {
        Self(self.0 & other.0)
    }

    /// Members of `self` not in `other`
    #[must_use]
    pub fn difference(self, other: QueryIdSet) -> Self {
        Self(self.0 & !other.0)
    }

    /// Lowest query id in the set
    pub fn first(self) -> Option<QueryId> {
        if self.0 == 0 {
            None
        } else {
            Some(QueryId(self.0.trailing_zeros() as u8))
        }
    }

    /// Number of members
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// True when the set has no members
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate members in ascending id order
    pub fn iter(self) -> QueryIdIter {
        QueryIdIter(self.0)
    }
}

impl fmt::Debug for QueryIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<QueryId> for QueryIdSet {
    fn from_iter<I: IntoIterator<Item = QueryId>>(iter: I) -> Self {
        let mut set = QueryIdSet::EMPTY;
        for q in iter {
            set.insert(q);
        }
        set
    }
}

impl IntoIterator for QueryIdSet {
    type Item = QueryId;
    type IntoIter = QueryIdIter;

    fn into_iter(self) -> QueryIdIter {
        self.iter()
    }
}

/// Iterator over the members of a [`QueryIdSet`]
pub struct QueryIdIter(u64);

impl Iterator for QueryIdIter {
    type Item = QueryId;

    fn next(&mut self) -> Option<QueryId> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(QueryId(bit as u8))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}
