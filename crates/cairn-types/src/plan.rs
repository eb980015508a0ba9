//! Plan execution records (one per top-level run) and their 1:1 metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ambiance::ExecutionMetadata;
use crate::status::Status;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,
    /// The plan graph this execution runs.
    pub plan_id: Uuid,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub setup_abstractions: BTreeMap<String, String>,
    pub metadata: ExecutionMetadata,
    pub governance_metadata: Option<serde_json::Value>,
    /// Physical deletion deadline.
    pub valid_until: Option<DateTime<Utc>>,
}

/// Fields written alongside a plan status change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanExecutionUpdate {
    pub end_ts: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl PlanExecutionUpdate {
    pub fn ended(at: DateTime<Utc>) -> Self {
        Self {
            end_ts: Some(at),
            ..Default::default()
        }
    }

    pub fn apply(&self, plan: &mut PlanExecution) {
        if let Some(ts) = self.end_ts {
            plan.end_ts = Some(ts);
        }
        if let Some(ts) = self.valid_until {
            plan.valid_until = Some(ts);
        }
    }
}

/// Columns readable through a plan projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanExecutionField {
    PlanId,
    Status,
    CreatedAt,
    EndTs,
    SetupAbstractions,
    Metadata,
    GovernanceMetadata,
    ValidUntil,
}

impl PlanExecutionField {
    pub fn column(self) -> &'static str {
        match self {
            Self::PlanId => "plan_id",
            Self::Status => "status",
            Self::CreatedAt => "created_at",
            Self::EndTs => "end_ts",
            Self::SetupAbstractions => "setup_abstractions",
            Self::Metadata => "metadata",
            Self::GovernanceMetadata => "governance_metadata",
            Self::ValidUntil => "valid_until",
        }
    }
}

/// Partial plan record. Only requested fields are populated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanExecutionProjection {
    pub id: Uuid,
    pub plan_id: Option<Uuid>,
    pub status: Option<Status>,
    pub created_at: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub setup_abstractions: Option<BTreeMap<String, String>>,
    pub metadata: Option<ExecutionMetadata>,
    pub governance_metadata: Option<serde_json::Value>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl PlanExecutionProjection {
    pub fn project(plan: &PlanExecution, fields: &[PlanExecutionField]) -> Self {
        let mut p = Self {
            id: plan.id,
            ..Default::default()
        };
        for field in fields {
            match field {
                PlanExecutionField::PlanId => p.plan_id = Some(plan.plan_id),
                PlanExecutionField::Status => p.status = Some(plan.status),
                PlanExecutionField::CreatedAt => p.created_at = Some(plan.created_at),
                PlanExecutionField::EndTs => p.end_ts = plan.end_ts,
                PlanExecutionField::SetupAbstractions => {
                    p.setup_abstractions = Some(plan.setup_abstractions.clone())
                }
                PlanExecutionField::Metadata => p.metadata = Some(plan.metadata.clone()),
                PlanExecutionField::GovernanceMetadata => {
                    p.governance_metadata = plan.governance_metadata.clone()
                }
                PlanExecutionField::ValidUntil => p.valid_until = plan.valid_until,
            }
        }
        p
    }
}

/// Which stages the most recent retry replayed and which it copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryStagesMetadata {
    pub parent_plan_execution_id: Option<Uuid>,
    #[serde(default)]
    pub retry_stage_identifiers: Vec<String>,
    #[serde(default)]
    pub identity_stage_identifiers: Vec<String>,
}

/// Plan-scoped metadata, created with the plan and deleted with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecutionMetadata {
    pub plan_execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_stages_metadata: Option<RetryStagesMetadata>,
    pub created_at: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
}
