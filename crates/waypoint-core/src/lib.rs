//! Waypoint Core - Parallel Columnar Query Execution
//!
//! This crate provides the execution core of Waypoint, implementing:
//! - Columnar chunks carrying a per-tuple bitstring of live queries
//! - Token pools bounding CPU and disk concurrency
//! - A segmented central hash table shared by every running join
//! - The generic operator state machine (GLA / GT / GIST)
//! - A coordinator that routes work descriptions to a fixed worker pool
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │         Coordinator (ExecutionEngine)        │
//! │   (Plan routing, token admission, merges)   │
//! └──────────────┬──────────────────────────────┘
//!                │ WorkAssignment / Completion
//! ┌──────────────┴──────────────────────────────┐
//! │              Worker Pool                     │
//! │     (Stage runners: scan, GT, GLA, GIST)    │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │    Operators          │   Join Waypoints     │
//! │ (state machine,       │ (build / probe over  │
//! │  library operators)   │  the central table)  │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   Chunks & Bitstrings · Segmented Hash Table │
//! │          · Token Pools · Cleaner            │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use waypoint_core::chunk::{Chunk, Column, QueryId, QueryIdSet};
//! use waypoint_core::config::EngineConfig;
//! use waypoint_core::dispatch::{ExecutionEngine, MemorySource, PlanBuilder};
//! use waypoint_core::operator::library::Count;
//!
//! # fn main() -> waypoint_core::Result<()> {
//! let q = QueryId::new(0)?;
//! let chunk = Chunk::uniform(vec![(0, Column::from(vec![1i64, 2, 3]))], QueryIdSet::single(q))?;
//!
//! let mut plan = PlanBuilder::new();
//! let scan = plan.scan("numbers", Arc::new(MemorySource::new(vec![chunk])));
//! let count = plan.gla("count", scan, Arc::new(Count));
//! plan.query(q, &[scan, count]);
//!
//! let mut engine = ExecutionEngine::new(EngineConfig::default())?;
//! let results = engine.run(&plan.build()?)?;
//! println!("{:?}", results.output(q));
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hash;
pub mod join;
pub mod operator;
pub mod tokens;

pub use error::{Error, Result};
