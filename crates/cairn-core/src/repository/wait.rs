//! Durable correlation-id registry used by the notify engine.

use chrono::{DateTime, Utc};

use cairn_types::error::RepositoryError;
use cairn_types::notify::{NotifyPayload, WaitRecord};

/// Wait record storage. Each state change is a conditional write so that
/// concurrent deliveries for the same id resolve to exactly one winner.
pub trait WaitRepository: Send + Sync {
    /// Insert a `Waiting` record unless one exists. Returns the stored record.
    fn insert_waiting(
        &self,
        correlation_id: &str,
    ) -> impl std::future::Future<Output = Result<WaitRecord, RepositoryError>> + Send;

    /// Record a delivery. Succeeds (returns `true`) only when no record exists
    /// yet or the record is still `Waiting`.
    fn mark_delivered(
        &self,
        correlation_id: &str,
        payload: &NotifyPayload,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Move a `Delivered` record to `Consumed`, returning its payload.
    fn mark_consumed(
        &self,
        correlation_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<NotifyPayload>, RepositoryError>> + Send;

    fn get_wait(
        &self,
        correlation_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WaitRecord>, RepositoryError>> + Send;

    /// Remove consumed records last touched before `before`.
    fn delete_consumed_before(
        &self,
        before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Remove the records of the given correlation ids, whatever their state.
    fn delete_waits(
        &self,
        correlation_ids: &[String],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
