//! TTL-based physical deletion of finished plan executions.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use cairn_types::error::RepositoryError;
use cairn_types::node::ExecutableResponse;

use crate::event::{ObserverFuture, PlanExecutionDeleteObserver, StatusEventBus};
use crate::notify::plan_callback_id;
use crate::repository::Backend;
use crate::repository::metadata::PlanMetadataRepository;
use crate::repository::node_execution::NodeExecutionRepository;
use crate::repository::plan_execution::PlanExecutionRepository;
use crate::repository::wait::WaitRepository;
use crate::retry::RetryPolicy;

pub struct RetentionService<B: Backend> {
    backend: Arc<B>,
    bus: StatusEventBus,
    retry: RetryPolicy,
    batch_size: usize,
}

impl<B: Backend> RetentionService<B> {
    pub fn new(backend: Arc<B>, bus: StatusEventBus, retry: RetryPolicy, batch_size: usize) -> Self {
        Self {
            backend,
            bus,
            retry,
            batch_size: batch_size.max(1),
        }
    }

    /// Delete every plan whose `valid_until` is at or before `now`, along
    /// with its nodes and every wait record scoped to them. Delete observers
    /// run before each batch is removed.
    ///
    /// Returns the number of plans deleted.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut purged = 0;
        loop {
            let batch = self
                .backend
                .plans()
                .find_expired_plans(now, self.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            self.bus.fire_deleted(&batch).await;
            let correlation_ids = self.plan_correlation_ids(&batch).await?;
            let waits = self
                .retry
                .run_repo("delete_waits", || {
                    self.backend.waits().delete_waits(&correlation_ids)
                })
                .await?;
            let nodes = self
                .retry
                .run_repo("delete_nodes_by_plans", || {
                    self.backend.nodes().delete_nodes_by_plans(&batch)
                })
                .await?;
            let plans = self
                .retry
                .run_repo("delete_plans", || self.backend.plans().delete_plans(&batch))
                .await?;
            tracing::info!(plans, nodes, waits, "expired plan executions purged");
            purged += plans;

            if batch.len() < self.batch_size {
                break;
            }
        }

        let waits = self
            .retry
            .run_repo("delete_consumed_waits", || {
                self.backend.waits().delete_consumed_before(now)
            })
            .await?;
        if waits > 0 {
            tracing::debug!(waits, "consumed wait records removed");
        }
        Ok(purged)
    }

    /// Correlation ids owned by `plans`: the plan callbacks, the notify ids
    /// of child nodes and the callbacks of parked steps.
    async fn plan_correlation_ids(&self, plans: &[Uuid]) -> Result<Vec<String>, RepositoryError> {
        let mut ids = BTreeSet::new();
        for plan_execution_id in plans {
            ids.insert(plan_callback_id(plan_execution_id));
            for node in self.backend.nodes().fetch_nodes_by_plan(plan_execution_id).await? {
                ids.extend(node.notify_id);
                for response in node.executable_responses {
                    if let ExecutableResponse::Async { callback_ids } = response {
                        ids.extend(callback_ids);
                    }
                }
            }
        }
        Ok(ids.into_iter().collect())
    }
}

/// Removes plan-scoped metadata rows of plans about to be deleted.
pub struct MetadataCleanupObserver<B: Backend> {
    backend: Arc<B>,
    retry: RetryPolicy,
}

impl<B: Backend> MetadataCleanupObserver<B> {
    pub fn new(backend: Arc<B>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }
}

impl<B: Backend> PlanExecutionDeleteObserver for MetadataCleanupObserver<B> {
    fn name(&self) -> &str {
        "metadata-cleanup"
    }

    fn on_plans_deleted<'a>(&'a self, plan_execution_ids: &'a [Uuid]) -> ObserverFuture<'a> {
        Box::pin(async move {
            let removed = self
                .retry
                .run_repo("delete_metadata_by_plans", || {
                    self.backend.metadata().delete_metadata_by_plans(plan_execution_ids)
                })
                .await?;
            tracing::debug!(removed, "plan metadata removed");
            Ok(())
        })
    }
}
