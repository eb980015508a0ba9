//! Resume (retry-from-stage) with identity nodes.
//!
//! Resuming a finished plan execution produces a new plan execution whose
//! node tree mirrors the original. Nodes outside the re-run stages that ended
//! in a resumable status become identity nodes: they carry the original's
//! outcome and are never executed again. Everything else is queued afresh.
//! All pointers are remapped into the new id space.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use cairn_types::ambiance::{ExecutionMetadata, RetryInfo, TriggerType};
use cairn_types::error::RepositoryError;
use cairn_types::graph::StepCategory;
use cairn_types::node::{NodeExecution, NodeExecutionField, NodeType};
use cairn_types::plan::{PlanExecution, PlanExecutionMetadata, RetryStagesMetadata};
use cairn_types::status::Status;

use crate::repository::Backend;
use crate::repository::graph::PlanGraphRepository;
use crate::repository::metadata::PlanMetadataRepository;
use crate::repository::node_execution::NodeExecutionRepository;
use crate::repository::plan_execution::PlanExecutionRepository;

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("plan execution {0} not found")]
    NotFound(Uuid),

    #[error("plan execution {id} is {status} and cannot be resumed")]
    NotResumable { id: Uuid, status: Status },

    #[error("stage '{0}' does not exist in the plan execution")]
    UnknownStage(String),

    #[error("malformed node tree: {0}")]
    Structural(String),

    #[error("original node execution {0} no longer exists")]
    DanglingOriginal(Uuid),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// A resumed plan execution, built but not yet persisted.
#[derive(Debug, Clone)]
pub struct ResumedPlan {
    pub plan: PlanExecution,
    pub metadata: PlanExecutionMetadata,
    /// Parents before children, siblings in chain order.
    pub nodes: Vec<NodeExecution>,
}

impl ResumedPlan {
    pub fn identity_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Identity)
            .count()
    }
}

pub struct IdentityStrategy<B: Backend> {
    backend: Arc<B>,
    ttl: Duration,
}

impl<B: Backend> IdentityStrategy<B> {
    pub fn new(backend: Arc<B>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub async fn build_resumed_plan(
        &self,
        original_id: &Uuid,
        stages_to_rerun: &BTreeSet<String>,
    ) -> Result<ResumedPlan, ResumeError> {
        let original = self
            .backend
            .plans()
            .get_plan(original_id)
            .await?
            .ok_or(ResumeError::NotFound(*original_id))?;
        if !original.status.is_final() {
            return Err(ResumeError::NotResumable {
                id: original.id,
                status: original.status,
            });
        }

        let all = self.backend.nodes().fetch_nodes_by_plan(original_id).await?;
        let live = drop_superseded(&all)?;

        let mut known_stages: HashSet<String> = live
            .iter()
            .filter_map(|n| n.stage_identifier.clone())
            .collect();
        if let Some(graph) = self.backend.graphs().get_graph(&original.plan_id).await? {
            known_stages.extend(graph.stage_identifiers().into_iter().map(str::to_string));
        }
        if let Some(unknown) = stages_to_rerun.iter().find(|s| !known_stages.contains(*s)) {
            return Err(ResumeError::UnknownStage(unknown.clone()));
        }

        let tree = NodeTree::build(&live)?;
        let ordered = tree.ordered()?;
        let rerun = tree.needs_rerun(&ordered, stages_to_rerun);

        let now = Utc::now();
        let valid_until = now + self.ttl;
        let plan = resumed_plan_record(&original, now, valid_until);

        let id_map: HashMap<Uuid, Uuid> =
            ordered.iter().map(|n| (n.id, Uuid::now_v7())).collect();

        let mut nodes = Vec::with_capacity(ordered.len());
        for (position, old) in ordered.iter().enumerate() {
            let created_at = now + Duration::microseconds(position as i64);
            let mut node = remap(old, &id_map, &plan, created_at)?;
            node.valid_until = Some(valid_until);
            if rerun.contains(&old.id) {
                reset_for_rerun(&mut node);
            } else {
                self.copy_outcome(old, &mut node).await?;
            }
            nodes.push(node);
        }

        let mut identity_stages: Vec<String> = nodes
            .iter()
            .filter(|n| {
                n.node_type == NodeType::Identity && n.step_category == StepCategory::Stage
            })
            .map(|n| n.identifier.clone())
            .collect();
        identity_stages.sort();
        identity_stages.dedup();

        let metadata = PlanExecutionMetadata {
            plan_execution_id: plan.id,
            notes: None,
            retry_stages_metadata: Some(RetryStagesMetadata {
                parent_plan_execution_id: Some(original.id),
                retry_stage_identifiers: stages_to_rerun.iter().cloned().collect(),
                identity_stage_identifiers: identity_stages,
            }),
            created_at: now,
            valid_until: Some(valid_until),
        };

        tracing::info!(
            original_plan_execution_id = %original.id,
            plan_execution_id = %plan.id,
            nodes = nodes.len(),
            identity = nodes.iter().filter(|n| n.node_type == NodeType::Identity).count(),
            "resumed plan built"
        );

        Ok(ResumedPlan {
            plan,
            metadata,
            nodes,
        })
    }

    /// Save the metadata and every node. The plan record itself is created by
    /// the plan execution service so the status bus sees it.
    pub async fn persist(&self, resumed: &ResumedPlan) -> Result<(), ResumeError> {
        self.backend.metadata().save_metadata(&resumed.metadata).await?;
        self.backend.nodes().save_nodes(&resumed.nodes).await?;
        Ok(())
    }

    async fn copy_outcome(
        &self,
        old: &NodeExecution,
        node: &mut NodeExecution,
    ) -> Result<(), ResumeError> {
        let original = self
            .backend
            .nodes()
            .get_node_projection(
                &old.id,
                &[NodeExecutionField::Status, NodeExecutionField::Outputs],
            )
            .await?
            .ok_or(ResumeError::DanglingOriginal(old.id))?;

        node.node_type = NodeType::Identity;
        node.original_node_execution_id = Some(old.id);
        node.status = original.status.unwrap_or(old.status);
        node.outputs = original.outputs;
        node.failure_info = old.failure_info.clone();
        node.executable_responses = old.executable_responses.clone();
        node.adviser_response = old.adviser_response.clone();
        node.start_ts = old.start_ts;
        node.end_ts = old.end_ts;
        if let Some(level) = node.ambiance.levels.last_mut() {
            level.node_type = NodeType::Identity;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tree reconstruction
// ---------------------------------------------------------------------------

/// Live nodes: everything except superseded retry attempts and their subtrees.
fn drop_superseded(all: &[NodeExecution]) -> Result<Vec<&NodeExecution>, ResumeError> {
    let by_id: HashMap<Uuid, &NodeExecution> = all.iter().map(|n| (n.id, n)).collect();
    let mut live = Vec::with_capacity(all.len());
    for node in all {
        let mut superseded = node.old_retry;
        let mut cursor = node.parent_id;
        let mut depth = 0;
        while let Some(parent_id) = cursor {
            let parent = by_id.get(&parent_id).ok_or_else(|| {
                ResumeError::Structural(format!(
                    "node {} points at missing parent {parent_id}",
                    node.id
                ))
            })?;
            superseded |= parent.old_retry;
            cursor = parent.parent_id;
            depth += 1;
            if depth > all.len() {
                return Err(ResumeError::Structural(format!(
                    "parent cycle through node {}",
                    node.id
                )));
            }
        }
        if !superseded {
            live.push(node);
        }
    }
    Ok(live)
}

struct NodeTree<'a> {
    /// Children of each parent (`None` for top level), in chain order.
    groups: HashMap<Option<Uuid>, Vec<&'a NodeExecution>>,
}

impl<'a> NodeTree<'a> {
    fn build(live: &[&'a NodeExecution]) -> Result<Self, ResumeError> {
        let mut raw: HashMap<Option<Uuid>, Vec<&'a NodeExecution>> = HashMap::new();
        for node in live {
            raw.entry(node.parent_id).or_default().push(node);
        }
        let mut groups = HashMap::with_capacity(raw.len());
        for (parent, members) in raw {
            groups.insert(parent, order_chain(members)?);
        }
        Ok(Self { groups })
    }

    /// Depth-first, parents before children.
    fn ordered(&self) -> Result<Vec<&'a NodeExecution>, ResumeError> {
        let mut out = Vec::new();
        self.visit(None, &mut out);
        let total: usize = self.groups.values().map(Vec::len).sum();
        if out.len() != total {
            return Err(ResumeError::Structural(format!(
                "{} node(s) are not reachable from the top level",
                total - out.len()
            )));
        }
        Ok(out)
    }

    fn visit(&self, parent: Option<Uuid>, out: &mut Vec<&'a NodeExecution>) {
        if let Some(members) = self.groups.get(&parent) {
            for node in members {
                out.push(node);
                self.visit(Some(node.id), out);
            }
        }
    }

    /// Ids of nodes that must run again.
    ///
    /// A node re-runs when its stage is selected, when its status is not
    /// resumable, when it was skipped without ever starting, or when any
    /// descendant re-runs (a parent cannot replay an outcome that one of its
    /// children is about to change).
    fn needs_rerun(
        &self,
        ordered: &[&'a NodeExecution],
        stages: &BTreeSet<String>,
    ) -> HashSet<Uuid> {
        let mut rerun = HashSet::new();
        // Children come after parents in `ordered`, so walk it backwards.
        for node in ordered.iter().rev() {
            let selected = node
                .stage_identifier
                .as_ref()
                .is_some_and(|s| stages.contains(s));
            let child_reruns = self
                .groups
                .get(&Some(node.id))
                .is_some_and(|children| children.iter().any(|c| rerun.contains(&c.id)));
            let never_started = node.status == Status::Skipped && node.start_ts.is_none();
            if selected || !node.status.is_resumable() || never_started || child_reruns {
                rerun.insert(node.id);
            }
        }
        rerun
    }
}

/// Order one sibling group by its `previous_id` chains.
fn order_chain(members: Vec<&NodeExecution>) -> Result<Vec<&NodeExecution>, ResumeError> {
    let ids: HashSet<Uuid> = members.iter().map(|n| n.id).collect();
    let mut successor: HashMap<Uuid, &NodeExecution> = HashMap::new();
    let mut heads = Vec::new();

    for node in &members {
        match node.previous_id {
            None => heads.push(*node),
            Some(prev) if !ids.contains(&prev) => {
                return Err(ResumeError::Structural(format!(
                    "node {} follows {prev}, which is not a sibling",
                    node.id
                )));
            }
            Some(prev) => {
                if let Some(other) = successor.insert(prev, node) {
                    return Err(ResumeError::Structural(format!(
                        "chain forks after {prev}: {} and {}",
                        other.id, node.id
                    )));
                }
            }
        }
    }

    heads.sort_by(|a, b| {
        runtime_key(&a.level_runtime_idx)
            .cmp(&runtime_key(&b.level_runtime_idx))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });

    let mut ordered = Vec::with_capacity(members.len());
    for head in heads {
        let mut cursor = Some(head);
        while let Some(node) = cursor {
            if ordered.len() > members.len() {
                break;
            }
            ordered.push(node);
            cursor = successor.get(&node.id).copied();
        }
    }
    if ordered.len() != members.len() {
        return Err(ResumeError::Structural(format!(
            "{} sibling(s) are unreachable from any chain head",
            members.len().abs_diff(ordered.len())
        )));
    }
    Ok(ordered)
}

/// `level_runtime_idx` as numbers, so `0|10` sorts after `0|2`.
fn runtime_key(level_runtime_idx: &str) -> Vec<u32> {
    level_runtime_idx
        .split('|')
        .map(|part| part.parse().unwrap_or(u32::MAX))
        .collect()
}

// ---------------------------------------------------------------------------
// Record construction
// ---------------------------------------------------------------------------

fn resumed_plan_record(
    original: &PlanExecution,
    now: chrono::DateTime<Utc>,
    valid_until: chrono::DateTime<Utc>,
) -> PlanExecution {
    let root = original
        .metadata
        .retry_info
        .as_ref()
        .map(|r| r.root_plan_execution_id)
        .unwrap_or(original.id);
    let mut metadata: ExecutionMetadata = original.metadata.clone();
    metadata.run_sequence += 1;
    metadata.trigger.trigger_type = TriggerType::Retry;
    metadata.retry_info = Some(RetryInfo {
        parent_plan_execution_id: original.id,
        root_plan_execution_id: root,
    });

    PlanExecution {
        id: Uuid::now_v7(),
        plan_id: original.plan_id,
        status: Status::Running,
        created_at: now,
        last_updated_at: now,
        start_ts: now,
        end_ts: None,
        setup_abstractions: original.setup_abstractions.clone(),
        metadata,
        governance_metadata: original.governance_metadata.clone(),
        valid_until: Some(valid_until),
    }
}

/// Copy `old` into the new plan, rewriting every id it carries.
fn remap(
    old: &NodeExecution,
    id_map: &HashMap<Uuid, Uuid>,
    plan: &PlanExecution,
    created_at: chrono::DateTime<Utc>,
) -> Result<NodeExecution, ResumeError> {
    let lookup = |id: Uuid| {
        id_map.get(&id).copied().ok_or_else(|| {
            ResumeError::Structural(format!("node {} references unmapped node {id}", old.id))
        })
    };

    let mut node = old.clone();
    node.id = lookup(old.id)?;
    node.plan_execution_id = plan.id;
    node.parent_id = old.parent_id.map(&lookup).transpose()?;
    node.previous_id = old.previous_id.map(&lookup).transpose()?;
    node.notify_id = None;
    node.created_at = created_at;
    node.last_updated_at = created_at;

    node.ambiance = old.ambiance.clone_for_plan(plan.id);
    node.ambiance.metadata = plan.metadata.clone();
    for level in &mut node.ambiance.levels {
        level.node_execution_id = lookup(level.node_execution_id)?;
    }
    Ok(node)
}

fn reset_for_rerun(node: &mut NodeExecution) {
    node.status = Status::Queued;
    node.node_type = NodeType::Plan;
    node.original_node_execution_id = None;
    node.executable_responses.clear();
    node.adviser_response = None;
    node.outputs = None;
    node.failure_info = None;
    node.old_retry = false;
    node.retry_index = 0;
    node.start_ts = None;
    node.end_ts = None;
    if let Some(level) = node.ambiance.levels.last_mut() {
        level.retry_index = 0;
    }
}
