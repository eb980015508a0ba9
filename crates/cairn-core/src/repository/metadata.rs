//! Plan execution metadata repository trait definition.

use uuid::Uuid;

use cairn_types::error::RepositoryError;
use cairn_types::plan::PlanExecutionMetadata;

pub trait PlanMetadataRepository: Send + Sync {
    /// Upsert the metadata of a plan execution.
    fn save_metadata(
        &self,
        metadata: &PlanExecutionMetadata,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_metadata(
        &self,
        plan_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<PlanExecutionMetadata>, RepositoryError>>
    + Send;

    fn delete_metadata_by_plans(
        &self,
        plan_execution_ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
