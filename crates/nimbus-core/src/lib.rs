//! Business logic for the Nimbus Core Engine: task lifecycle orchestration,
//! planning, safety evaluation, execution, checkpointing, drift detection,
//! and rollback.
//!
//! Persistence lives in `nimbus-db`; this crate is where the rules live.

pub mod capability;
pub mod checkpoint;
pub mod drift;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod rollback;
pub mod safety;
pub mod state;
pub mod token;
