//! Immutable plan graph definitions.
//!
//! A `PlanGraph` is produced by an upstream planner and never changes once
//! submitted. Node executions reference its nodes by `node_id`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structural role of a node in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Pipeline,
    Stages,
    Stage,
    StepGroup,
    Strategy,
    Fork,
    #[default]
    Step,
}

/// How a node is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The handler returns its response inline.
    #[default]
    Sync,
    /// The handler may park the node and respond later through a callback.
    Async,
    /// Runs a single child; its siblings follow via `next_node_id`.
    Child,
    /// Runs all children concurrently.
    Children,
    /// Runs children one after another in declaration order.
    ChildChain,
}

impl ExecutionMode {
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            ExecutionMode::Child | ExecutionMode::Children | ExecutionMode::ChildChain
        )
    }
}

/// What the default adviser does when a node ends in a broken status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Stop the sibling chain and let the failure propagate.
    #[default]
    Fail,
    /// Record `IGNORE_FAILED` and continue with the next sibling.
    Ignore,
    /// Record `SUCCEEDED` and continue with the next sibling.
    MarkSuccess,
    /// Run the node again, up to `max_retries` more times.
    Retry {
        max_retries: u32,
        #[serde(default)]
        wait_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    /// Key into the step handler registry. Ignored for composite modes.
    #[serde(default)]
    pub step_type: String,
    #[serde(default)]
    pub step_category: StepCategory,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    /// Concurrency bound for `Children` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Sibling to advance to after this node succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A submitted plan: nodes plus the id of the root node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanGraph {
    #[serde(default = "Uuid::now_v7")]
    pub plan_id: Uuid,
    pub root_node_id: String,
    pub nodes: Vec<PlanNode>,
}

impl PlanGraph {
    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn root(&self) -> Option<&PlanNode> {
        self.node(&self.root_node_id)
    }

    /// Identifiers of every stage node in the graph.
    pub fn stage_identifiers(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.step_category == StepCategory::Stage)
            .map(|n| n.identifier.as_str())
            .collect()
    }
}
