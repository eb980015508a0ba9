//! Shared domain types for the cairn execution engine.
//!
//! Statuses, execution context, plan/node records, wait records, events
//! and configuration. Zero infrastructure dependencies: only serde, uuid,
//! chrono, thiserror.

pub mod ambiance;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod node;
pub mod notify;
pub mod plan;
pub mod status;
