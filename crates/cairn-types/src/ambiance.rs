//! Execution context threaded through every node call.
//!
//! An `Ambiance` is a plain value: the owning plan execution, a stack of
//! levels (one per nesting depth of the running node), a tenant-scoping
//! abstraction map and run metadata. Deriving a child context clones and
//! appends; nothing is ever mutated in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::StepCategory;
use crate::node::NodeType;

/// Well-known setup abstraction keys.
pub mod keys {
    pub const ACCOUNT_ID: &str = "accountId";
    pub const ORG_ID: &str = "orgIdentifier";
    pub const PROJECT_ID: &str = "projectIdentifier";
}

/// One entry in the ambiance level stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub node_execution_id: Uuid,
    /// Id of the plan graph node being executed.
    pub node_id: String,
    pub identifier: String,
    pub node_type: NodeType,
    pub step_category: StepCategory,
    pub start_ts: DateTime<Utc>,
    /// Distinguishes repeated executions of the same node at this depth.
    #[serde(default)]
    pub runtime_idx: u32,
    #[serde(default)]
    pub retry_index: u32,
}

/// How a plan execution was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Webhook,
    Scheduled,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TriggerInfo {
    pub trigger_type: TriggerType,
    /// Principal that triggered the run.
    #[serde(default)]
    pub triggered_by: String,
}

/// Lineage of a retried (resumed) plan execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryInfo {
    pub parent_plan_execution_id: Uuid,
    pub root_plan_execution_id: Uuid,
}

/// Run-level metadata carried by every ambiance of a plan execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub run_sequence: u32,
    #[serde(default)]
    pub trigger: TriggerInfo,
    #[serde(default)]
    pub pipeline_identifier: String,
    /// Free-form grouping tag (e.g. a branch name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_info: Option<RetryInfo>,
}

/// Execution context of one node (or of the plan itself when `levels` is empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: Uuid,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

impl Ambiance {
    /// Plan-level ambiance with no levels.
    pub fn new(
        plan_execution_id: Uuid,
        setup_abstractions: BTreeMap<String, String>,
        metadata: ExecutionMetadata,
    ) -> Self {
        Self {
            plan_execution_id,
            levels: Vec::new(),
            setup_abstractions,
            metadata,
        }
    }

    /// Derive the context of a child by appending `level`.
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }

    /// Derive the context of the enclosing node by dropping the last level.
    pub fn clone_for_finish(&self) -> Self {
        let mut parent = self.clone();
        parent.levels.pop();
        parent
    }

    /// Re-home this context into another plan execution, keeping levels.
    pub fn clone_for_plan(&self, plan_execution_id: Uuid) -> Self {
        let mut moved = self.clone();
        moved.plan_execution_id = plan_execution_id;
        moved
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn parent_level(&self) -> Option<&Level> {
        self.levels.iter().rev().nth(1)
    }

    /// Node execution id of the innermost level.
    pub fn current_runtime_id(&self) -> Option<Uuid> {
        self.current_level().map(|l| l.node_execution_id)
    }

    pub fn parent_runtime_id(&self) -> Option<Uuid> {
        self.parent_level().map(|l| l.node_execution_id)
    }

    /// The nearest enclosing level whose step category is `Stage`.
    pub fn stage_level(&self) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_category == StepCategory::Stage)
    }

    /// Runtime indices of every level joined with `|`, e.g. `0|2|0`.
    pub fn level_runtime_idx(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.runtime_idx.to_string())
            .collect::<Vec<_>>()
            .join("|")
    }

    /// True when this context belongs to a resumed (retried) plan execution.
    pub fn is_retry(&self) -> bool {
        self.metadata.retry_info.is_some()
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.get(keys::ACCOUNT_ID).map(String::as_str)
    }

    pub fn org_id(&self) -> Option<&str> {
        self.setup_abstractions.get(keys::ORG_ID).map(String::as_str)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.setup_abstractions.get(keys::PROJECT_ID).map(String::as_str)
    }
}
