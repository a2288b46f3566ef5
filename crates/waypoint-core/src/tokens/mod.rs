//! Admission control: CPU and disk work tokens
//!
//! Every stage invocation runs under a [`WorkToken`]. CPU tokens bound the
//! chunks processed in parallel, disk tokens bound outstanding reads, and a
//! separate reserve keeps the table cleaner from being starved by readers.
//! Acquisition blocks (wait/wake on a condition variable) rather than fails.

mod hoard;
mod pool;

pub use hoard::DiskHoard;
pub use pool::{HIGHEST_PRIORITY, Priority, TokenKind, TokenPool, TokenStats, WorkToken};
