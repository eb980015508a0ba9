//! In-memory `Backend` for tests and ephemeral runs.
//!
//! Every port is implemented on one struct over `DashMap`s. Conditional
//! writes hold the entry's shard lock while checking the precondition, which
//! gives the same single-winner behavior as the SQLite statements.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::stream;
use uuid::Uuid;

use cairn_core::execution::transition::Transition;
use cairn_core::repository::graph::PlanGraphRepository;
use cairn_core::repository::lock::{Lease, LockError, LockProvider, lease_duration};
use cairn_core::repository::metadata::PlanMetadataRepository;
use cairn_core::repository::node_execution::NodeExecutionRepository;
use cairn_core::repository::plan_execution::PlanExecutionRepository;
use cairn_core::repository::wait::WaitRepository;
use cairn_core::repository::{Backend, RepositoryStream};
use cairn_types::ambiance::keys;
use cairn_types::error::RepositoryError;
use cairn_types::graph::PlanGraph;
use cairn_types::node::{
    NodeExecution, NodeExecutionField, NodeExecutionProjection, NodeExecutionUpdate,
};
use cairn_types::notify::{NotifyPayload, WaitRecord, WaitState};
use cairn_types::plan::{
    PlanExecution, PlanExecutionField, PlanExecutionMetadata, PlanExecutionProjection,
    PlanExecutionUpdate,
};
use cairn_types::status::{Status, StatusSet};

#[derive(Default)]
pub struct MemoryBackend {
    plans: DashMap<Uuid, PlanExecution>,
    nodes: DashMap<Uuid, NodeExecution>,
    metadata: DashMap<Uuid, PlanExecutionMetadata>,
    graphs: DashMap<Uuid, PlanGraph>,
    waits: DashMap<String, WaitRecord>,
    leases: DashMap<String, Lease>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes_where(&self, keep: impl Fn(&NodeExecution) -> bool) -> Vec<NodeExecution> {
        let mut nodes: Vec<NodeExecution> = self
            .nodes
            .iter()
            .filter(|n| keep(n.value()))
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        nodes
    }

    fn plans_where(&self, keep: impl Fn(&PlanExecution) -> bool) -> Vec<PlanExecution> {
        let mut plans: Vec<PlanExecution> = self
            .plans
            .iter()
            .filter(|p| keep(p.value()))
            .map(|p| p.value().clone())
            .collect();
        plans.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        plans
    }
}

fn admits<U>(transition: &Transition<U>, current: Status) -> bool {
    transition
        .precondition()
        .is_none_or(|set| set.contains(current))
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

impl PlanExecutionRepository for MemoryBackend {
    async fn save_plan(&self, plan: &PlanExecution) -> Result<(), RepositoryError> {
        match self.plans.entry(plan.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "plan execution {} already exists",
                plan.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(plan.clone());
                Ok(())
            }
        }
    }

    async fn get_plan(&self, id: &Uuid) -> Result<Option<PlanExecution>, RepositoryError> {
        Ok(self.plans.get(id).map(|p| p.value().clone()))
    }

    async fn get_plan_projection(
        &self,
        id: &Uuid,
        fields: &[PlanExecutionField],
    ) -> Result<Option<PlanExecutionProjection>, RepositoryError> {
        Ok(self
            .plans
            .get(id)
            .map(|p| PlanExecutionProjection::project(p.value(), fields)))
    }

    async fn update_plan_status(
        &self,
        id: &Uuid,
        transition: &Transition<PlanExecutionUpdate>,
    ) -> Result<Option<PlanExecution>, RepositoryError> {
        let Some(mut plan) = self.plans.get_mut(id) else {
            return Ok(None);
        };
        if !admits(transition, plan.status) {
            return Ok(None);
        }
        plan.status = transition.target;
        plan.last_updated_at = Utc::now();
        transition.update.apply(&mut plan);
        Ok(Some(plan.clone()))
    }

    fn find_plans_by_status<'a>(
        &'a self,
        statuses: StatusSet,
        fields: &'a [PlanExecutionField],
    ) -> RepositoryStream<'a, PlanExecutionProjection> {
        let found: Vec<_> = self
            .plans_where(|p| statuses.contains(p.status))
            .iter()
            .map(|p| Ok(PlanExecutionProjection::project(p, fields)))
            .collect();
        Box::pin(stream::iter(found))
    }

    async fn delete_plans(&self, ids: &[Uuid]) -> Result<u64, RepositoryError> {
        Ok(ids.iter().filter(|id| self.plans.remove(id).is_some()).count() as u64)
    }

    async fn update_plan_ttl(
        &self,
        id: &Uuid,
        valid_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        match self.plans.get_mut(id) {
            Some(mut plan) => {
                plan.valid_until = Some(valid_until);
                plan.last_updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_expired_plans(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let mut expired: Vec<(DateTime<Utc>, Uuid)> = self
            .plans
            .iter()
            .filter_map(|p| p.valid_until.filter(|t| *t <= now).map(|t| (t, p.id)))
            .collect();
        expired.sort();
        Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn count_active_plans_for_account(&self, account_id: &str) -> Result<u64, RepositoryError> {
        Ok(self
            .plans
            .iter()
            .filter(|p| {
                p.status.is_active()
                    && p.setup_abstractions.get(keys::ACCOUNT_ID).map(String::as_str)
                        == Some(account_id)
            })
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

impl NodeExecutionRepository for MemoryBackend {
    async fn save_node(&self, node: &NodeExecution) -> Result<(), RepositoryError> {
        match self.nodes.entry(node.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "node execution {} already exists",
                node.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(node.clone());
                Ok(())
            }
        }
    }

    async fn save_nodes(&self, nodes: &[NodeExecution]) -> Result<(), RepositoryError> {
        if let Some(dup) = nodes.iter().find(|n| self.nodes.contains_key(&n.id)) {
            return Err(RepositoryError::Conflict(format!(
                "node execution {} already exists",
                dup.id
            )));
        }
        for node in nodes {
            self.nodes.insert(node.id, node.clone());
        }
        Ok(())
    }

    async fn get_node(&self, id: &Uuid) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self.nodes.get(id).map(|n| n.value().clone()))
    }

    async fn get_node_projection(
        &self,
        id: &Uuid,
        fields: &[NodeExecutionField],
    ) -> Result<Option<NodeExecutionProjection>, RepositoryError> {
        Ok(self
            .nodes
            .get(id)
            .map(|n| NodeExecutionProjection::project(n.value(), fields)))
    }

    async fn update_node_status(
        &self,
        id: &Uuid,
        transition: &Transition<NodeExecutionUpdate>,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let Some(mut node) = self.nodes.get_mut(id) else {
            return Ok(None);
        };
        if !admits(transition, node.status) {
            return Ok(None);
        }
        node.status = transition.target;
        node.last_updated_at = Utc::now();
        transition.update.apply(&mut node);
        Ok(Some(node.clone()))
    }

    async fn update_node(
        &self,
        id: &Uuid,
        update: &NodeExecutionUpdate,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self.nodes.get_mut(id).map(|mut node| {
            node.last_updated_at = Utc::now();
            update.apply(&mut node);
            node.clone()
        }))
    }

    fn find_nodes_by_status<'a>(
        &'a self,
        statuses: StatusSet,
        fields: &'a [NodeExecutionField],
    ) -> RepositoryStream<'a, NodeExecutionProjection> {
        let found: Vec<_> = self
            .nodes_where(|n| !n.old_retry && statuses.contains(n.status))
            .iter()
            .map(|n| Ok(NodeExecutionProjection::project(n, fields)))
            .collect();
        Box::pin(stream::iter(found))
    }

    async fn fetch_children(
        &self,
        plan_execution_id: &Uuid,
        parent_id: Option<&Uuid>,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        Ok(self.nodes_where(|n| {
            n.plan_execution_id == *plan_execution_id
                && n.parent_id.as_ref() == parent_id
                && !n.old_retry
        }))
    }

    async fn fetch_nodes_by_plan(
        &self,
        plan_execution_id: &Uuid,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        Ok(self.nodes_where(|n| n.plan_execution_id == *plan_execution_id))
    }

    async fn fetch_nodes_with_status(
        &self,
        plan_execution_id: &Uuid,
        statuses: StatusSet,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        Ok(self.nodes_where(|n| {
            n.plan_execution_id == *plan_execution_id
                && !n.old_retry
                && statuses.contains(n.status)
        }))
    }

    async fn fetch_node_statuses(
        &self,
        plan_execution_id: &Uuid,
        within: StatusSet,
    ) -> Result<Vec<Status>, RepositoryError> {
        Ok(self
            .fetch_nodes_with_status(plan_execution_id, within)
            .await?
            .into_iter()
            .map(|n| n.status)
            .collect())
    }

    async fn find_existing_node(
        &self,
        plan_execution_id: &Uuid,
        parent_id: Option<&Uuid>,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self
            .fetch_children(plan_execution_id, parent_id)
            .await?
            .into_iter()
            .filter(|n| n.node_id == node_id)
            .next_back())
    }

    async fn delete_nodes_by_plans(&self, plan_execution_ids: &[Uuid]) -> Result<u64, RepositoryError> {
        let before = self.nodes.len();
        self.nodes
            .retain(|_, n| !plan_execution_ids.contains(&n.plan_execution_id));
        Ok((before - self.nodes.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Metadata, graphs
// ---------------------------------------------------------------------------

impl PlanMetadataRepository for MemoryBackend {
    async fn save_metadata(&self, metadata: &PlanExecutionMetadata) -> Result<(), RepositoryError> {
        self.metadata
            .insert(metadata.plan_execution_id, metadata.clone());
        Ok(())
    }

    async fn get_metadata(
        &self,
        plan_execution_id: &Uuid,
    ) -> Result<Option<PlanExecutionMetadata>, RepositoryError> {
        Ok(self.metadata.get(plan_execution_id).map(|m| m.value().clone()))
    }

    async fn delete_metadata_by_plans(
        &self,
        plan_execution_ids: &[Uuid],
    ) -> Result<u64, RepositoryError> {
        Ok(plan_execution_ids
            .iter()
            .filter(|id| self.metadata.remove(id).is_some())
            .count() as u64)
    }
}

impl PlanGraphRepository for MemoryBackend {
    async fn save_graph(&self, graph: &PlanGraph) -> Result<(), RepositoryError> {
        self.graphs
            .entry(graph.plan_id)
            .or_insert_with(|| graph.clone());
        Ok(())
    }

    async fn get_graph(&self, plan_id: &Uuid) -> Result<Option<PlanGraph>, RepositoryError> {
        Ok(self.graphs.get(plan_id).map(|g| g.value().clone()))
    }
}

// ---------------------------------------------------------------------------
// Waits, leases
// ---------------------------------------------------------------------------

impl WaitRepository for MemoryBackend {
    async fn insert_waiting(&self, correlation_id: &str) -> Result<WaitRecord, RepositoryError> {
        let now = Utc::now();
        let record = self
            .waits
            .entry(correlation_id.to_string())
            .or_insert_with(|| WaitRecord {
                correlation_id: correlation_id.to_string(),
                state: WaitState::Waiting,
                payload: None,
                created_at: now,
                updated_at: now,
            });
        Ok(record.value().clone())
    }

    async fn mark_delivered(
        &self,
        correlation_id: &str,
        payload: &NotifyPayload,
    ) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        match self.waits.entry(correlation_id.to_string()) {
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.state != WaitState::Waiting {
                    return Ok(false);
                }
                record.state = WaitState::Delivered;
                record.payload = Some(payload.clone());
                record.updated_at = now;
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(WaitRecord {
                    correlation_id: correlation_id.to_string(),
                    state: WaitState::Delivered,
                    payload: Some(payload.clone()),
                    created_at: now,
                    updated_at: now,
                });
                Ok(true)
            }
        }
    }

    async fn mark_consumed(
        &self,
        correlation_id: &str,
    ) -> Result<Option<NotifyPayload>, RepositoryError> {
        let Some(mut record) = self.waits.get_mut(correlation_id) else {
            return Ok(None);
        };
        if record.state != WaitState::Delivered {
            return Ok(None);
        }
        record.state = WaitState::Consumed;
        record.updated_at = Utc::now();
        Ok(record.payload.clone())
    }

    async fn get_wait(&self, correlation_id: &str) -> Result<Option<WaitRecord>, RepositoryError> {
        Ok(self.waits.get(correlation_id).map(|w| w.value().clone()))
    }

    async fn delete_consumed_before(&self, before: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let start = self.waits.len();
        self.waits
            .retain(|_, w| !(w.state == WaitState::Consumed && w.updated_at < before));
        Ok((start - self.waits.len()) as u64)
    }

    async fn delete_waits(&self, correlation_ids: &[String]) -> Result<u64, RepositoryError> {
        let removed = correlation_ids
            .iter()
            .filter(|id| self.waits.remove(id.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }
}

impl LockProvider for MemoryBackend {
    async fn try_acquire(
        &self,
        name: &str,
        owner: Uuid,
        lease: Duration,
    ) -> Result<Option<Lease>, LockError> {
        let now = Utc::now();
        let granted = Lease {
            name: name.to_string(),
            owner,
            expires_at: now + lease_duration(lease),
        };
        match self.leases.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().expires_at > now {
                    return Ok(None);
                }
                slot.insert(granted.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(granted.clone());
            }
        }
        Ok(Some(granted))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LockError> {
        Ok(self
            .leases
            .remove_if(&lease.name, |_, held| held.owner == lease.owner)
            .is_some())
    }
}

impl Backend for MemoryBackend {
    type Plans = Self;
    type Nodes = Self;
    type Metadata = Self;
    type Graphs = Self;
    type Waits = Self;
    type Locks = Self;

    fn plans(&self) -> &Self {
        self
    }

    fn nodes(&self) -> &Self {
        self
    }

    fn metadata(&self) -> &Self {
        self
    }

    fn graphs(&self) -> &Self {
        self
    }

    fn waits(&self) -> &Self {
        self
    }

    fn locks(&self) -> &Self {
        self
    }
}
