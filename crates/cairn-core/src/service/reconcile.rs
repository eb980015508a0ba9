//! Periodic repair of plan statuses that drifted from their nodes.
//!
//! A driver task that failed mid-advancement leaves the plan in whatever
//! status it last committed. The sweep re-derives it: a plan whose live
//! nodes are all final is ended with their aggregate, any other active plan
//! gets a running-status recompute.

use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use uuid::Uuid;

use cairn_types::error::RepositoryError;
use cairn_types::plan::{PlanExecutionField, PlanExecutionUpdate};
use cairn_types::status::Status;

use super::plan_execution::{PlanExecutionService, PlanTransition};
use crate::repository::Backend;
use crate::repository::plan_execution::PlanExecutionRepository;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub ended: usize,
    pub recomputed: usize,
}

pub struct Reconciler<B: Backend> {
    backend: Arc<B>,
    plans: Arc<PlanExecutionService<B>>,
}

impl<B: Backend> Reconciler<B> {
    pub fn new(backend: Arc<B>, plans: Arc<PlanExecutionService<B>>) -> Self {
        Self { backend, plans }
    }

    pub async fn sweep(&self) -> Result<SweepReport, RepositoryError> {
        let active = Status::FINAL.complement();
        let fields = [PlanExecutionField::Status];
        let ids: Vec<Uuid> = {
            let mut stream = self.backend.plans().find_plans_by_status(active, &fields);
            let mut ids = Vec::new();
            while let Some(plan) = stream.next().await {
                ids.push(plan?.id);
            }
            ids
        };

        let mut report = SweepReport {
            scanned: ids.len(),
            ..Default::default()
        };
        for id in ids {
            let status = self.plans.calculate_status(&id).await?;
            if status.is_final() {
                let ended = self
                    .plans
                    .update_status(
                        &id,
                        PlanTransition::to(status)
                            .with_update(PlanExecutionUpdate::ended(Utc::now())),
                    )
                    .await?;
                if ended.is_applied() {
                    tracing::info!(plan_execution_id = %id, status = %status, "stranded plan ended");
                    report.ended += 1;
                }
            } else {
                self.plans.recompute_running_status(&id, None).await?;
                report.recomputed += 1;
            }
        }
        tracing::info!(
            scanned = report.scanned,
            ended = report.ended,
            recomputed = report.recomputed,
            "reconciliation sweep finished"
        );
        Ok(report)
    }
}
