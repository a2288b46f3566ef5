//! Synthetic tables and demonstration plans

use anyhow::Result;
use rand::Rng;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use waypoint_core::chunk::{Chunk, ChunkBuilder, DataType, QueryId, QueryIdSet, Value};
use waypoint_core::dispatch::{MemorySource, Plan, PlanBuilder};
use waypoint_core::join::{JoinLhs, JoinQueries, JoinRhs};
use waypoint_core::operator::library::{
    Average, BoundedPasses, Center, Collect, Count, GroupCount, KMeans1d, Sum,
};

const REGIONS: [&str; 4] = ["north", "south", "east", "west"];
const TIERS: [&str; 3] = ["bronze", "silver", "gold"];
pub const CUSTOMERS: i64 = 100;

/// Orders: `0` id, `1` customer, `2` amount, `3` region.
///
/// Query `i` sees an order when `id % (i + 1) == 0`.
pub fn orders(tuples: usize, chunk_tuples: usize, queries: usize, seed: u64) -> Result<Vec<Chunk>> {
    let schema = [
        (0, DataType::Int64),
        (1, DataType::Int64),
        (2, DataType::Float64),
        (3, DataType::Utf8),
    ];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut chunks = Vec::new();
    let mut builder = ChunkBuilder::new(&schema);
    for id in 0..tuples as i64 {
        let mask = (0..queries)
            .filter(|i| id % (*i as i64 + 1) == 0)
            .map(QueryId::new)
            .collect::<waypoint_core::Result<QueryIdSet>>()?;
        // two loose clusters so the k-means demo has something to find
        let center = if rng.gen_range(0..2) == 0 { 20.0 } else { 80.0 };
        builder.push_row(
            vec![
                Value::Int64(id),
                Value::Int64(rng.gen_range(0..CUSTOMERS)),
                Value::Float64(center + rng.gen_range(-5.0..5.0)),
                Value::from(REGIONS[rng.gen_range(0..REGIONS.len())]),
            ],
            mask,
        )?;
        if builder.len() == chunk_tuples {
            chunks.push(std::mem::replace(&mut builder, ChunkBuilder::new(&schema)).finish()?);
        }
    }
    if !builder.is_empty() {
        chunks.push(builder.finish()?);
    }
    Ok(chunks)
}

/// Customers: `0` id, `1` tier; live for every query
pub fn customers(queries: QueryIdSet) -> Result<Vec<Chunk>> {
    let mut builder = ChunkBuilder::new(&[(0, DataType::Int64), (1, DataType::Utf8)]);
    for id in 0..CUSTOMERS {
        builder.push_row(
            vec![Value::Int64(id), Value::from(TIERS[id as usize % TIERS.len()])],
            queries,
        )?;
    }
    Ok(vec![builder.finish()?])
}

fn query_ids(queries: usize) -> Result<Vec<QueryId>> {
    Ok((0..queries).map(QueryId::new).collect::<waypoint_core::Result<_>>()?)
}

/// Tuple count per query
pub fn count_plan(orders: Vec<Chunk>, queries: usize) -> Result<Plan> {
    let mut plan = PlanBuilder::new();
    let scan = plan.scan("orders", Arc::new(MemorySource::new(orders)));
    let count = plan.gla("count", scan, Arc::new(Count));
    for q in query_ids(queries)? {
        plan.query(q, &[scan, count]);
    }
    Ok(plan.build()?)
}

/// Orders per region, emitted in `fragments` pieces
pub fn group_plan(orders: Vec<Chunk>, queries: usize, fragments: usize) -> Result<Plan> {
    let mut plan = PlanBuilder::new();
    let scan = plan.scan("orders", Arc::new(MemorySource::new(orders)));
    let group = plan.gla("by_region", scan, Arc::new(GroupCount::new(3, DataType::Utf8, fragments)));
    for q in query_ids(queries)? {
        plan.query(q, &[scan, group]);
    }
    Ok(plan.build()?)
}

/// Orders joined to their customer, counted per customer tier
pub fn join_plan(orders: Vec<Chunk>, queries: usize) -> Result<Plan> {
    let ids = query_ids(queries)?;
    let all: QueryIdSet = ids.iter().copied().collect();

    let mut plan = PlanBuilder::new();
    let customers = plan.scan("customers", Arc::new(MemorySource::new(customers(all)?)));
    let rhs = JoinRhs::new(plan.next_id(), vec![(0, DataType::Int64)], vec![(1, DataType::Utf8)]);
    let build = plan.join_rhs("customers_build", customers, rhs);

    let scan = plan.scan("orders", Arc::new(MemorySource::new(orders)));
    let lhs = JoinLhs::new(
        build,
        vec![1],
        vec![(4, DataType::Utf8)],
        JoinQueries {
            inner: all,
            ..JoinQueries::default()
        },
    )?;
    let probe = plan.join_lhs("orders_probe", scan, lhs);
    let group = plan.gla("by_tier", probe, Arc::new(GroupCount::new(4, DataType::Utf8, 1)));
    for q in ids {
        plan.route(q, &[customers, build]);
        plan.query(q, &[scan, probe, group]);
    }
    Ok(plan.build()?)
}

/// Sum of the centered amounts; close to zero for every query
pub fn center_plan(orders: Vec<Chunk>, queries: usize) -> Result<Plan> {
    let mut plan = PlanBuilder::new();
    let scan = plan.scan("orders", Arc::new(MemorySource::new(orders)));
    let mean = plan.gla("mean_amount", scan, Arc::new(Average::new(2).as_state()));
    let center = plan.gt("center", scan, Arc::new(Center::new(2)));
    let sum = plan.gla("sum_centered", center, Arc::new(Sum::new(0)));
    plan.constant_input(center, mean);
    for q in query_ids(queries)? {
        plan.route(q, &[scan, mean]);
        plan.query(q, &[scan, center, sum]);
    }
    Ok(plan.build()?)
}

/// One-dimensional k-means over the amounts
pub fn kmeans_plan(orders: Vec<Chunk>, queries: usize, k: usize) -> Result<Plan> {
    let mut plan = PlanBuilder::new();
    let scan = plan.scan("orders", Arc::new(MemorySource::new(orders)));
    let collect = plan.gla("amounts", scan, Arc::new(Collect::new(2)));
    let kmeans = plan.gist("kmeans", Arc::new(KMeans1d::new(k, 50)));
    plan.constant_input(kmeans, collect);
    for q in query_ids(queries)? {
        plan.route(q, &[scan, collect]);
        plan.query(q, &[kmeans]);
    }
    Ok(plan.build()?)
}

/// Tuple count repeated over `passes` passes of the same scan
pub fn passes_plan(orders: Vec<Chunk>, queries: usize, passes: u32) -> Result<Plan> {
    let mut plan = PlanBuilder::new();
    let scan = plan.scan("orders", Arc::new(MemorySource::new(orders)));
    let passes = plan.gla("passes", scan, Arc::new(BoundedPasses::new(passes)));
    for q in query_ids(queries)? {
        plan.query(q, &[scan, passes]);
    }
    Ok(plan.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_masks() {
        let chunks = orders(10, 4, 3, 7).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(Chunk::num_tuples).sum::<usize>(), 10);

        let q1 = QueryId::new(1).unwrap();
        let q2 = QueryId::new(2).unwrap();
        let first = &chunks[0];
        // ids 0..4
        assert_eq!(first.bitstring()[0], QueryIdSet::first_n(3));
        assert!(!first.bitstring()[1].contains(q1));
        assert!(first.bitstring()[2].contains(q1));
        assert!(first.bitstring()[3].contains(q2));
    }

    #[test]
    fn test_demo_plans_build() {
        let data = orders(50, 16, 2, 1).unwrap();
        count_plan(data.clone(), 2).unwrap();
        group_plan(data.clone(), 2, 3).unwrap();
        join_plan(data.clone(), 2).unwrap();
        center_plan(data.clone(), 2).unwrap();
        kmeans_plan(data.clone(), 2, 2).unwrap();
        passes_plan(data, 2, 3).unwrap();
    }
}
