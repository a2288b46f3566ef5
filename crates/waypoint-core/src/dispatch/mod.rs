//! Scheduler and dispatcher
//!
//! Plans are built with [`PlanBuilder`], then executed by an
//! [`ExecutionEngine`]: a coordinator that turns chunk arrivals and stage
//! completions into [`WorkDescription`]s, admits them through the token
//! pools and runs them on a fixed pool of worker threads.

mod engine;
mod plan;
mod results;
mod work;
mod worker;

pub use engine::ExecutionEngine;
pub use plan::{ChunkSource, MemorySource, Plan, PlanBuilder, Waypoint, WaypointKind};
pub use results::{QueryOutput, QueryResults, RunStats};
pub use work::{
    Completion, ExecEngineData, NextStage, Settled, StageContext, StageRunner, StageTag, WorkAssignment,
    WorkDescription,
};
