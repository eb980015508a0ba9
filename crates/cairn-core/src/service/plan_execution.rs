//! Plan execution service.
//!
//! Owns every plan status write. A write goes through the transition guard,
//! is retried on transient persistence failures, and on success fires the
//! status event bus. Reaching a final status also delivers the plan's
//! `callback:<id>` correlation id so callers blocked in `await_plan` wake up.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use cairn_types::config::LockConfig;
use cairn_types::error::RepositoryError;
use cairn_types::event::PlanStatusEvent;
use cairn_types::notify::NotifyPayload;
use cairn_types::plan::{PlanExecution, PlanExecutionField, PlanExecutionUpdate};
use cairn_types::status::{Status, StatusSet};

use crate::event::StatusEventBus;
use crate::execution::aggregate::aggregate;
use crate::execution::transition::{Transition, TransitionOutcome, settle};
use crate::notify::{NotifyEngine, plan_callback_id};
use crate::repository::Backend;
use crate::repository::lock::{self, Lease, LockProvider};
use crate::repository::node_execution::NodeExecutionRepository;
use crate::repository::plan_execution::PlanExecutionRepository;
use crate::retry::RetryPolicy;

pub type PlanTransition = Transition<PlanExecutionUpdate>;

/// Name of the lease serializing running-status recomputes of one plan.
pub fn status_lock_name(plan_execution_id: &Uuid) -> String {
    format!("PLAN_STATUS_UPDATE_LOCK_{plan_execution_id}")
}

pub struct PlanExecutionService<B: Backend> {
    backend: Arc<B>,
    bus: StatusEventBus,
    notify: Arc<NotifyEngine<B>>,
    retry: RetryPolicy,
    lock: LockConfig,
}

impl<B: Backend> PlanExecutionService<B> {
    pub fn new(
        backend: Arc<B>,
        bus: StatusEventBus,
        notify: Arc<NotifyEngine<B>>,
        retry: RetryPolicy,
        lock: LockConfig,
    ) -> Self {
        Self {
            backend,
            bus,
            notify,
            retry,
            lock,
        }
    }

    /// Persist a new plan execution and announce its initial status.
    pub async fn create(&self, plan: &PlanExecution) -> Result<(), RepositoryError> {
        self.retry
            .run_repo("save_plan", || self.backend.plans().save_plan(plan))
            .await?;
        tracing::info!(plan_execution_id = %plan.id, status = %plan.status, "plan execution created");
        self.bus.fire_status(&PlanStatusEvent::from_plan(plan)).await;
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Result<PlanExecution, RepositoryError> {
        self.backend
            .plans()
            .get_plan(id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    pub async fn get_status(&self, id: &Uuid) -> Result<Status, RepositoryError> {
        self.backend
            .plans()
            .get_plan_projection(id, &[PlanExecutionField::Status])
            .await?
            .and_then(|p| p.status)
            .ok_or(RepositoryError::NotFound)
    }

    /// Guarded status write. `Stale` when the precondition did not hold.
    pub async fn update_status(
        &self,
        id: &Uuid,
        transition: PlanTransition,
    ) -> Result<TransitionOutcome<PlanExecution>, RepositoryError> {
        let written = self
            .retry
            .run_repo("update_plan_status", || {
                self.backend.plans().update_plan_status(id, &transition)
            })
            .await?;
        let outcome = settle("plan_execution", *id, transition.target, written);

        if let TransitionOutcome::Applied(plan) = &outcome {
            tracing::info!(plan_execution_id = %id, status = %plan.status, "plan status updated");
            self.bus.fire_status(&PlanStatusEvent::from_plan(plan)).await;
            if plan.status.is_final() {
                self.notify_finished(plan).await;
            }
        }
        Ok(outcome)
    }

    /// Force the plan into ERRORED. Used when the engine cannot make progress.
    pub async fn mark_errored(
        &self,
        id: &Uuid,
    ) -> Result<TransitionOutcome<PlanExecution>, RepositoryError> {
        tracing::error!(plan_execution_id = %id, "marking plan execution errored");
        self.update_status(
            id,
            PlanTransition::to(Status::Errored)
                .with_update(PlanExecutionUpdate::ended(Utc::now()))
                .forced(),
        )
        .await
    }

    /// Aggregate of every live node of the plan.
    pub async fn calculate_status(&self, id: &Uuid) -> Result<Status, RepositoryError> {
        let statuses = self
            .backend
            .nodes()
            .fetch_node_statuses(id, StatusSet::ALL)
            .await?;
        Ok(aggregate(&statuses))
    }

    /// Re-derive the plan status after a node left a blocking status.
    ///
    /// Runs under the plan's status lease. The plan is left alone if it is
    /// already RUNNING. Otherwise the statuses of live nodes that are neither
    /// flowing nor final are aggregated, with one occurrence of `exclude`
    /// (the status the triggering node just left) dropped from the input; a
    /// final aggregate means nothing is blocked any more, so the plan returns
    /// to RUNNING. Failing to get the lease within the wait is logged and
    /// skipped.
    pub async fn recompute_running_status(
        &self,
        id: &Uuid,
        exclude: Option<Status>,
    ) -> Result<(), RepositoryError> {
        let Some(lease) = self.acquire_status_lease(id).await else {
            return Ok(());
        };
        let result = self.recompute_locked(id, exclude).await;
        self.release_status_lease(&lease).await;
        result
    }

    async fn recompute_locked(
        &self,
        id: &Uuid,
        exclude: Option<Status>,
    ) -> Result<(), RepositoryError> {
        if self.get_status(id).await? == Status::Running {
            return Ok(());
        }

        let waiting = Status::FLOWING.union(Status::FINAL).complement();
        let mut statuses = self.backend.nodes().fetch_node_statuses(id, waiting).await?;
        if let Some(pos) = exclude.and_then(|ex| statuses.iter().position(|s| *s == ex)) {
            statuses.remove(pos);
        }

        let mut target = aggregate(&statuses);
        if target.is_final() {
            target = Status::Running;
        }
        tracing::debug!(plan_execution_id = %id, status = %target, "recomputed running status");
        self.update_status(id, PlanTransition::to(target)).await?;
        Ok(())
    }

    /// Propagate a node entering a blocking status to the plan.
    ///
    /// Uses the same lease as the recompute so the strongest blocking status
    /// present among the plan's nodes wins.
    pub async fn on_node_blocked(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let Some(lease) = self.acquire_status_lease(id).await else {
            return Ok(());
        };
        let result = self.block_locked(id).await;
        self.release_status_lease(&lease).await;
        result
    }

    async fn block_locked(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let blocking = self
            .backend
            .nodes()
            .fetch_node_statuses(id, Status::BLOCKING)
            .await?;
        if blocking.is_empty() {
            return Ok(());
        }
        self.update_status(id, PlanTransition::to(aggregate(&blocking)))
            .await?;
        Ok(())
    }

    /// Move the plan's physical deletion deadline. `false` if the plan is missing.
    pub async fn update_ttl(
        &self,
        id: &Uuid,
        valid_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.retry
            .run_repo("update_plan_ttl", || {
                self.backend.plans().update_plan_ttl(id, valid_until)
            })
            .await
    }

    pub async fn count_active_for_account(&self, account_id: &str) -> Result<u64, RepositoryError> {
        self.backend
            .plans()
            .count_active_plans_for_account(account_id)
            .await
    }

    async fn notify_finished(&self, plan: &PlanExecution) {
        let payload = NotifyPayload::PlanFinished {
            plan_execution_id: plan.id,
            status: plan.status,
        };
        if let Err(e) = self.notify.deliver(&plan_callback_id(&plan.id), payload).await {
            tracing::warn!(plan_execution_id = %plan.id, error = %e, "plan callback delivery failed");
        }
    }

    async fn acquire_status_lease(&self, id: &Uuid) -> Option<Lease> {
        let name = status_lock_name(id);
        match lock::acquire(self.backend.locks(), &name, &self.lock).await {
            Ok(Some(lease)) => Some(lease),
            Ok(None) => {
                tracing::warn!(
                    plan_execution_id = %id,
                    lock = %name,
                    "status lock wait expired, skipping"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    plan_execution_id = %id,
                    lock = %name,
                    error = %e,
                    "status lock unavailable, skipping"
                );
                None
            }
        }
    }

    async fn release_status_lease(&self, lease: &Lease) {
        match self.backend.locks().release(lease).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(lock = %lease.name, "status lease lapsed before release"),
            Err(e) => tracing::warn!(lock = %lease.name, error = %e, "status lease release failed"),
        }
    }
}
