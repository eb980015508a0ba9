//! Construction of new node execution records.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use cairn_types::ambiance::{Ambiance, Level};
use cairn_types::graph::PlanNode;
use cairn_types::node::{NodeExecution, NodeType};
use cairn_types::status::Status;

/// Everything needed to materialize a QUEUED node execution.
#[derive(Debug, Clone)]
pub struct NodeSpawn<'a> {
    /// Ambiance of the enclosing node (plan-level ambiance for the root).
    pub parent_ambiance: &'a Ambiance,
    pub plan_node: &'a PlanNode,
    pub parent_id: Option<Uuid>,
    pub previous_id: Option<Uuid>,
    pub notify_id: Option<String>,
    pub runtime_idx: u32,
    pub retry_index: u32,
    pub valid_until: Option<DateTime<Utc>>,
}

impl NodeSpawn<'_> {
    pub fn queued_node(&self) -> NodeExecution {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let ambiance = self.parent_ambiance.clone_for_child(Level {
            node_execution_id: id,
            node_id: self.plan_node.id.clone(),
            identifier: self.plan_node.identifier.clone(),
            node_type: NodeType::Plan,
            step_category: self.plan_node.step_category,
            start_ts: now,
            runtime_idx: self.runtime_idx,
            retry_index: self.retry_index,
        });

        NodeExecution {
            id,
            plan_execution_id: ambiance.plan_execution_id,
            stage_identifier: ambiance.stage_level().map(|l| l.identifier.clone()),
            level_runtime_idx: ambiance.level_runtime_idx(),
            ambiance,
            status: Status::Queued,
            node_id: self.plan_node.id.clone(),
            identifier: self.plan_node.identifier.clone(),
            name: self.plan_node.name.clone(),
            node_type: NodeType::Plan,
            step_category: self.plan_node.step_category,
            mode: self.plan_node.mode,
            parent_id: self.parent_id,
            previous_id: self.previous_id,
            notify_id: self.notify_id.clone(),
            original_node_execution_id: None,
            executable_responses: Vec::new(),
            adviser_response: None,
            outputs: None,
            failure_info: None,
            old_retry: false,
            retry_index: self.retry_index,
            created_at: now,
            last_updated_at: now,
            start_ts: None,
            end_ts: None,
            valid_until: self.valid_until,
        }
    }
}

/// A fresh attempt of `node`, taking over its position in the chain.
pub fn retry_attempt(node: &NodeExecution, plan_node: &PlanNode, retry_index: u32) -> NodeExecution {
    let parent_ambiance = node.ambiance.clone_for_finish();
    let runtime_idx = node
        .ambiance
        .current_level()
        .map(|l| l.runtime_idx)
        .unwrap_or_default();
    NodeSpawn {
        parent_ambiance: &parent_ambiance,
        plan_node,
        parent_id: node.parent_id,
        previous_id: node.previous_id,
        notify_id: node.notify_id.clone(),
        runtime_idx,
        retry_index,
        valid_until: node.valid_until,
    }
    .queued_node()
}
