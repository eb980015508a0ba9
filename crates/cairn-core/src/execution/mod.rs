//! Plan execution engine: status rules, graph checks and the driver.

pub mod adviser;
pub mod aggregate;
pub mod driver;
pub mod factory;
pub mod graph;
pub mod resume;
pub mod step;
pub mod transition;

pub use driver::{EngineError, Orchestrator, OrchestratorBuilder, PlanCacheEvictor, PlanSeed};
