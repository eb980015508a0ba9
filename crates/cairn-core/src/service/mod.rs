//! Services over the repository ports.
//!
//! Services own retries, guarded writes and event publication. They depend
//! on the `Backend` trait, never on a concrete storage implementation.

pub mod node_execution;
pub mod plan_execution;
pub mod reconcile;
pub mod retention;
