//! Plan execution repository trait definition.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use cairn_types::error::RepositoryError;
use cairn_types::plan::{
    PlanExecution, PlanExecutionField, PlanExecutionProjection, PlanExecutionUpdate,
};
use cairn_types::status::StatusSet;

use super::RepositoryStream;
use crate::execution::transition::Transition;

/// Storage for top-level plan executions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait PlanExecutionRepository: Send + Sync {
    /// Insert a new plan execution.
    fn save_plan(
        &self,
        plan: &PlanExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_plan(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<PlanExecution>, RepositoryError>> + Send;

    /// Read only the named fields.
    fn get_plan_projection(
        &self,
        id: &Uuid,
        fields: &[PlanExecutionField],
    ) -> impl std::future::Future<Output = Result<Option<PlanExecutionProjection>, RepositoryError>>
    + Send;

    /// Conditionally set the status, `last_updated_at` and the update fields.
    ///
    /// Returns the updated record, or `None` when the record is missing or its
    /// current status is outside `transition.precondition()`.
    fn update_plan_status(
        &self,
        id: &Uuid,
        transition: &Transition<PlanExecutionUpdate>,
    ) -> impl std::future::Future<Output = Result<Option<PlanExecution>, RepositoryError>> + Send;

    /// Stream projections of every plan whose status is in `statuses`.
    fn find_plans_by_status<'a>(
        &'a self,
        statuses: StatusSet,
        fields: &'a [PlanExecutionField],
    ) -> RepositoryStream<'a, PlanExecutionProjection>;

    /// Delete plan executions by id. Returns the number of rows removed.
    fn delete_plans(
        &self,
        ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Set the physical deletion deadline. Returns `false` if the plan is missing.
    fn update_plan_ttl(
        &self,
        id: &Uuid,
        valid_until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Ids of plans whose `valid_until` is at or before `now`, oldest first.
    fn find_expired_plans(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Number of plans in an active status for the given account.
    fn count_active_plans_for_account(
        &self,
        account_id: &str,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
