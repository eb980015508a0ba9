//! Node execution records and the response/adviser sum types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ambiance::Ambiance;
use crate::graph::{ExecutionMode, StepCategory};
use crate::status::Status;

/// Whether a node execution runs a real step or replays an earlier outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Plan,
    /// Copies the terminal outcome of a node from an earlier plan execution.
    Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
        }
    }
}

/// Record of how a node was dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutableResponse {
    Sync,
    Async { callback_ids: Vec<String> },
    Child { child_node_id: String },
    Children {
        child_node_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
    },
    ChildChain { child_node_ids: Vec<String> },
}

/// The adviser's decision after a node reached a final status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserResponse {
    NextStep { next_node_id: String },
    Retry { wait_ms: u64, retry_index: u32 },
    MarkSuccess,
    IgnoreFailure,
    End,
}

/// Terminal or intermediate response of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
}

impl StepResponse {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            outputs: None,
            failure_info: None,
        }
    }

    pub fn succeeded(outputs: Value) -> Self {
        Self {
            status: Status::Succeeded,
            outputs: Some(outputs),
            failure_info: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            outputs: None,
            failure_info: Some(FailureInfo::new(message)),
        }
    }
}

/// Durable record of one node run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub ambiance: Ambiance,
    pub status: Status,
    pub node_id: String,
    pub identifier: String,
    pub name: String,
    pub node_type: NodeType,
    pub step_category: StepCategory,
    /// Identifier of the enclosing stage, if any.
    pub stage_identifier: Option<String>,
    pub mode: ExecutionMode,
    pub parent_id: Option<Uuid>,
    pub previous_id: Option<Uuid>,
    /// Correlation id the parent waits on for this node (shared along a chain).
    pub notify_id: Option<String>,
    pub original_node_execution_id: Option<Uuid>,
    pub level_runtime_idx: String,
    pub executable_responses: Vec<ExecutableResponse>,
    pub adviser_response: Option<AdviserResponse>,
    pub outputs: Option<Value>,
    pub failure_info: Option<FailureInfo>,
    /// Superseded by a later retry attempt of the same node.
    pub old_retry: bool,
    pub retry_index: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Non-status fields written together with a status change or on their own.
///
/// `None` leaves the stored value untouched. `executable_response` is appended.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeExecutionUpdate {
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub failure_info: Option<FailureInfo>,
    pub outputs: Option<Value>,
    pub adviser_response: Option<AdviserResponse>,
    pub executable_response: Option<ExecutableResponse>,
    pub notify_id: Option<String>,
    pub old_retry: Option<bool>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl NodeExecutionUpdate {
    pub fn ended(at: DateTime<Utc>) -> Self {
        Self {
            end_ts: Some(at),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to an in-memory record.
    pub fn apply(&self, node: &mut NodeExecution) {
        if let Some(ts) = self.start_ts {
            node.start_ts = Some(ts);
        }
        if let Some(ts) = self.end_ts {
            node.end_ts = Some(ts);
        }
        if let Some(info) = &self.failure_info {
            node.failure_info = Some(info.clone());
        }
        if let Some(outputs) = &self.outputs {
            node.outputs = Some(outputs.clone());
        }
        if let Some(advice) = &self.adviser_response {
            node.adviser_response = Some(advice.clone());
        }
        if let Some(response) = &self.executable_response {
            node.executable_responses.push(response.clone());
        }
        if let Some(notify_id) = &self.notify_id {
            node.notify_id = Some(notify_id.clone());
        }
        if let Some(old_retry) = self.old_retry {
            node.old_retry = old_retry;
        }
        if let Some(ts) = self.valid_until {
            node.valid_until = Some(ts);
        }
    }
}

/// Columns readable through a node projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeExecutionField {
    Status,
    Ambiance,
    NodeId,
    Identifier,
    StageIdentifier,
    Mode,
    ParentId,
    PreviousId,
    NotifyId,
    OriginalNodeExecutionId,
    ExecutableResponses,
    AdviserResponse,
    Outputs,
    EndTs,
}

impl NodeExecutionField {
    pub fn column(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Ambiance => "ambiance",
            Self::NodeId => "node_id",
            Self::Identifier => "identifier",
            Self::StageIdentifier => "stage_identifier",
            Self::Mode => "mode",
            Self::ParentId => "parent_id",
            Self::PreviousId => "previous_id",
            Self::NotifyId => "notify_id",
            Self::OriginalNodeExecutionId => "original_node_execution_id",
            Self::ExecutableResponses => "executable_responses",
            Self::AdviserResponse => "adviser_response",
            Self::Outputs => "outputs",
            Self::EndTs => "end_ts",
        }
    }
}

/// Partial node record. Only requested fields are populated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeExecutionProjection {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub status: Option<Status>,
    pub ambiance: Option<Ambiance>,
    pub node_id: Option<String>,
    pub identifier: Option<String>,
    pub stage_identifier: Option<String>,
    pub mode: Option<ExecutionMode>,
    pub parent_id: Option<Uuid>,
    pub previous_id: Option<Uuid>,
    pub notify_id: Option<String>,
    pub original_node_execution_id: Option<Uuid>,
    pub executable_responses: Option<Vec<ExecutableResponse>>,
    pub adviser_response: Option<AdviserResponse>,
    pub outputs: Option<Value>,
    pub end_ts: Option<DateTime<Utc>>,
}

impl NodeExecutionProjection {
    /// Project an in-memory record down to `fields`.
    pub fn project(node: &NodeExecution, fields: &[NodeExecutionField]) -> Self {
        let mut p = Self {
            id: node.id,
            plan_execution_id: node.plan_execution_id,
            ..Default::default()
        };
        for field in fields {
            match field {
                NodeExecutionField::Status => p.status = Some(node.status),
                NodeExecutionField::Ambiance => p.ambiance = Some(node.ambiance.clone()),
                NodeExecutionField::NodeId => p.node_id = Some(node.node_id.clone()),
                NodeExecutionField::Identifier => p.identifier = Some(node.identifier.clone()),
                NodeExecutionField::StageIdentifier => {
                    p.stage_identifier = node.stage_identifier.clone()
                }
                NodeExecutionField::Mode => p.mode = Some(node.mode),
                NodeExecutionField::ParentId => p.parent_id = node.parent_id,
                NodeExecutionField::PreviousId => p.previous_id = node.previous_id,
                NodeExecutionField::NotifyId => p.notify_id = node.notify_id.clone(),
                NodeExecutionField::OriginalNodeExecutionId => {
                    p.original_node_execution_id = node.original_node_execution_id
                }
                NodeExecutionField::ExecutableResponses => {
                    p.executable_responses = Some(node.executable_responses.clone())
                }
                NodeExecutionField::AdviserResponse => {
                    p.adviser_response = node.adviser_response.clone()
                }
                NodeExecutionField::Outputs => p.outputs = node.outputs.clone(),
                NodeExecutionField::EndTs => p.end_ts = node.end_ts,
            }
        }
        p
    }
}
