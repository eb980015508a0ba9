//! Node execution service: guarded node writes and the queries the driver
//! needs.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use cairn_types::error::RepositoryError;
use cairn_types::node::{NodeExecution, NodeExecutionUpdate};
use cairn_types::status::{Status, StatusSet};

use crate::execution::transition::{Transition, TransitionOutcome, settle};
use crate::repository::Backend;
use crate::repository::node_execution::NodeExecutionRepository;
use crate::retry::RetryPolicy;

pub type NodeTransition = Transition<NodeExecutionUpdate>;

pub struct NodeExecutionService<B: Backend> {
    backend: Arc<B>,
    retry: RetryPolicy,
}

impl<B: Backend> NodeExecutionService<B> {
    pub fn new(backend: Arc<B>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    pub async fn create(&self, node: &NodeExecution) -> Result<(), RepositoryError> {
        self.retry
            .run_repo("save_node", || self.backend.nodes().save_node(node))
            .await?;
        tracing::debug!(
            plan_execution_id = %node.plan_execution_id,
            node_execution_id = %node.id,
            node_id = %node.node_id,
            "node execution created"
        );
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Result<NodeExecution, RepositoryError> {
        self.backend
            .nodes()
            .get_node(id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    /// Guarded status write. `Stale` when the precondition did not hold.
    pub async fn update_status(
        &self,
        id: &Uuid,
        transition: NodeTransition,
    ) -> Result<TransitionOutcome<NodeExecution>, RepositoryError> {
        let written = self
            .retry
            .run_repo("update_node_status", || {
                self.backend.nodes().update_node_status(id, &transition)
            })
            .await?;
        let outcome = settle("node_execution", *id, transition.target, written);
        if let TransitionOutcome::Applied(node) = &outcome {
            tracing::debug!(
                plan_execution_id = %node.plan_execution_id,
                node_execution_id = %id,
                status = %node.status,
                "node status updated"
            );
        }
        Ok(outcome)
    }

    /// Write non-status fields.
    pub async fn update(
        &self,
        id: &Uuid,
        update: NodeExecutionUpdate,
    ) -> Result<NodeExecution, RepositoryError> {
        self.retry
            .run_repo("update_node", || self.backend.nodes().update_node(id, &update))
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    pub async fn find_existing(
        &self,
        plan_execution_id: &Uuid,
        parent_id: Option<&Uuid>,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        self.backend
            .nodes()
            .find_existing_node(plan_execution_id, parent_id, node_id)
            .await
    }

    pub async fn children(
        &self,
        plan_execution_id: &Uuid,
        parent_id: Option<&Uuid>,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        self.backend
            .nodes()
            .fetch_children(plan_execution_id, parent_id)
            .await
    }

    pub async fn children_statuses(
        &self,
        plan_execution_id: &Uuid,
        parent_id: &Uuid,
    ) -> Result<Vec<Status>, RepositoryError> {
        Ok(self
            .children(plan_execution_id, Some(parent_id))
            .await?
            .into_iter()
            .map(|n| n.status)
            .collect())
    }

    pub async fn with_status(
        &self,
        plan_execution_id: &Uuid,
        statuses: StatusSet,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        self.backend
            .nodes()
            .fetch_nodes_with_status(plan_execution_id, statuses)
            .await
    }

    /// Flag `node` and its whole subtree as superseded by a retry attempt,
    /// taking them out of every live query. Returns how many were flagged.
    pub async fn supersede(&self, node: &NodeExecution) -> Result<usize, RepositoryError> {
        let mut pending = vec![node.id];
        let mut flagged = 0;
        while let Some(id) = pending.pop() {
            let children = self.children(&node.plan_execution_id, Some(&id)).await?;
            pending.extend(children.iter().map(|c| c.id));
            self.update(
                &id,
                NodeExecutionUpdate {
                    old_retry: Some(true),
                    ..Default::default()
                },
            )
            .await?;
            flagged += 1;
        }
        Ok(flagged)
    }

    /// Move QUEUED nodes that never started to SKIPPED.
    ///
    /// Limited to the children of `parent_id` when given, otherwise every
    /// queued node of the plan. Returns how many were skipped.
    pub async fn skip_unreached(
        &self,
        plan_execution_id: &Uuid,
        parent_id: Option<&Uuid>,
    ) -> Result<usize, RepositoryError> {
        let queued = StatusSet::of(&[Status::Queued]);
        let candidates = match parent_id {
            Some(parent) => self
                .children(plan_execution_id, Some(parent))
                .await?
                .into_iter()
                .filter(|n| n.status == Status::Queued)
                .collect(),
            None => self.with_status(plan_execution_id, queued).await?,
        };

        let mut skipped = 0;
        for node in candidates {
            let transition = NodeTransition::to(Status::Skipped)
                .with_update(NodeExecutionUpdate::ended(Utc::now()))
                .from_any_of(queued);
            if self.update_status(&node.id, transition).await?.is_applied() {
                skipped += 1;
            }
        }
        if skipped > 0 {
            tracing::debug!(plan_execution_id = %plan_execution_id, skipped, "unreached nodes skipped");
        }
        Ok(skipped)
    }
}
