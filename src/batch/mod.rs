//! Batch execution: planning, the per-row state machine, crash recovery
//! and the write-back queue.

pub mod artifacts;
pub mod executor;
pub mod planner;
pub mod recovery;
pub mod store;
pub mod types;
pub mod writeback;
