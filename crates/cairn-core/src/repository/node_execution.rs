//! Node execution repository trait definition.

use uuid::Uuid;

use cairn_types::error::RepositoryError;
use cairn_types::node::{
    NodeExecution, NodeExecutionField, NodeExecutionProjection, NodeExecutionUpdate,
};
use cairn_types::status::{Status, StatusSet};

use super::RepositoryStream;
use crate::execution::transition::Transition;

/// Storage for node executions.
///
/// "Live" queries skip nodes flagged `old_retry`: a retried node is
/// represented by its latest attempt only.
pub trait NodeExecutionRepository: Send + Sync {
    fn save_node(
        &self,
        node: &NodeExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Insert many nodes at once (used when materializing a resumed plan).
    fn save_nodes(
        &self,
        nodes: &[NodeExecution],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_node(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    fn get_node_projection(
        &self,
        id: &Uuid,
        fields: &[NodeExecutionField],
    ) -> impl std::future::Future<Output = Result<Option<NodeExecutionProjection>, RepositoryError>>
    + Send;

    /// Conditionally set status, `last_updated_at` and the update fields.
    ///
    /// `None` when the node is missing or the precondition did not match.
    fn update_node_status(
        &self,
        id: &Uuid,
        transition: &Transition<NodeExecutionUpdate>,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// Write non-status fields. Never touches `status`.
    fn update_node(
        &self,
        id: &Uuid,
        update: &NodeExecutionUpdate,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// Stream projections of every node whose status is in `statuses`.
    fn find_nodes_by_status<'a>(
        &'a self,
        statuses: StatusSet,
        fields: &'a [NodeExecutionField],
    ) -> RepositoryStream<'a, NodeExecutionProjection>;

    /// Live children of `parent_id` (top-level nodes when `None`), oldest first.
    fn fetch_children(
        &self,
        plan_execution_id: &Uuid,
        parent_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Every node of the plan, including old retries, oldest first.
    fn fetch_nodes_by_plan(
        &self,
        plan_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Live nodes of the plan whose status is in `statuses`, oldest first.
    fn fetch_nodes_with_status(
        &self,
        plan_execution_id: &Uuid,
        statuses: StatusSet,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Statuses of the plan's live nodes that fall inside `within`.
    fn fetch_node_statuses(
        &self,
        plan_execution_id: &Uuid,
        within: StatusSet,
    ) -> impl std::future::Future<Output = Result<Vec<Status>, RepositoryError>> + Send;

    /// Latest live execution of graph node `node_id` under `parent_id`.
    fn find_existing_node(
        &self,
        plan_execution_id: &Uuid,
        parent_id: Option<&Uuid>,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// Delete every node belonging to the given plans.
    fn delete_nodes_by_plans(
        &self,
        plan_execution_ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
