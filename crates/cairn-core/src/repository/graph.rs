//! Plan graph repository trait definition.

use uuid::Uuid;

use cairn_types::error::RepositoryError;
use cairn_types::graph::PlanGraph;

/// Storage for immutable plan graphs, keyed by `plan_id`.
pub trait PlanGraphRepository: Send + Sync {
    /// Store a graph. Saving the same `plan_id` twice keeps the first copy.
    fn save_graph(
        &self,
        graph: &PlanGraph,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_graph(
        &self,
        plan_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<PlanGraph>, RepositoryError>> + Send;
}
