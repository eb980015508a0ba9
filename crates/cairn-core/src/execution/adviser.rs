//! Advisers decide what follows a node that reached a final status.

use thiserror::Error;

use cairn_types::graph::{FailureStrategy, PlanNode};
use cairn_types::node::{AdviserResponse, NodeExecution};
use cairn_types::status::Status;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdviserError {
    #[error("node {0} is not in a final status")]
    NotFinal(String),

    #[error("adviser failed: {0}")]
    Failed(String),
}

pub trait Adviser: Send + Sync {
    fn advise(
        &self,
        node: &NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<AdviserResponse, AdviserError>;
}

/// Type-erased adviser held by the orchestrator.
pub struct BoxAdviser {
    inner: Box<dyn Adviser>,
}

impl BoxAdviser {
    pub fn new<A: Adviser + 'static>(adviser: A) -> Self {
        Self {
            inner: Box::new(adviser),
        }
    }

    pub fn advise(
        &self,
        node: &NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<AdviserResponse, AdviserError> {
        self.inner.advise(node, plan_node)
    }
}

impl Default for BoxAdviser {
    fn default() -> Self {
        Self::new(GraphAdviser)
    }
}

impl std::fmt::Debug for BoxAdviser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAdviser").finish_non_exhaustive()
    }
}

/// Follows `next_node_id` on success and the node's failure strategy otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphAdviser;

impl Adviser for GraphAdviser {
    fn advise(
        &self,
        node: &NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<AdviserResponse, AdviserError> {
        if !node.status.is_final() {
            return Err(AdviserError::NotFinal(node.id.to_string()));
        }

        if !node.status.is_broken() {
            return Ok(next_or_end(plan_node));
        }
        // An aborted plan never advances.
        if node.status == Status::Aborted {
            return Ok(AdviserResponse::End);
        }

        let response = match &plan_node.failure_strategy {
            FailureStrategy::Fail => AdviserResponse::End,
            FailureStrategy::Ignore => AdviserResponse::IgnoreFailure,
            FailureStrategy::MarkSuccess => AdviserResponse::MarkSuccess,
            FailureStrategy::Retry {
                max_retries,
                wait_ms,
            } if node.retry_index < *max_retries => AdviserResponse::Retry {
                wait_ms: *wait_ms,
                retry_index: node.retry_index + 1,
            },
            FailureStrategy::Retry { .. } => AdviserResponse::End,
        };
        Ok(response)
    }
}

/// Sibling advance for a node that ended positively.
pub fn next_or_end(plan_node: &PlanNode) -> AdviserResponse {
    match &plan_node.next_node_id {
        Some(next) => AdviserResponse::NextStep {
            next_node_id: next.clone(),
        },
        None => AdviserResponse::End,
    }
}
