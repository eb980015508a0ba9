//! Events published when plan executions change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ambiance::ExecutionMetadata;
use crate::plan::PlanExecution;
use crate::status::Status;

/// A plan execution committed a new status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatusEvent {
    pub plan_execution_id: Uuid,
    pub status: Status,
    pub setup_abstractions: BTreeMap<String, String>,
    pub metadata: ExecutionMetadata,
    pub at: DateTime<Utc>,
}

impl PlanStatusEvent {
    pub fn from_plan(plan: &PlanExecution) -> Self {
        Self {
            plan_execution_id: plan.id,
            status: plan.status,
            setup_abstractions: plan.setup_abstractions.clone(),
            metadata: plan.metadata.clone(),
            at: plan.last_updated_at,
        }
    }
}
