//! Execution strategy driver.
//!
//! The `Orchestrator` walks a plan graph: it starts nodes, dispatches leaf
//! nodes to step handlers, fans composite nodes out to their children, feeds
//! responses through the adviser and ends the plan once the top-level chain
//! is done. Every node runs on its own tokio task inside a `node` span.
//! Suspension happens only at notify handle awaits, so a parked node holds
//! no thread.
//!
//! Failures inside a spawned node task are logged with `tracing::error!`;
//! the node keeps its last committed status and the reconciliation sweep
//! picks the plan up later.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use cairn_types::ambiance::{Ambiance, ExecutionMetadata};
use cairn_types::config::EngineConfig;
use cairn_types::error::RepositoryError;
use cairn_types::event::PlanStatusEvent;
use cairn_types::graph::{ExecutionMode, PlanGraph, PlanNode};
use cairn_types::node::{
    AdviserResponse, ExecutableResponse, FailureInfo, NodeExecution, NodeExecutionField,
    NodeExecutionUpdate, StepResponse,
};
use cairn_types::notify::NotifyPayload;
use cairn_types::plan::{
    PlanExecution, PlanExecutionField, PlanExecutionMetadata, PlanExecutionUpdate,
};
use cairn_types::status::{Status, StatusSet};

use super::adviser::{BoxAdviser, next_or_end};
use super::aggregate::aggregate;
use super::factory::{NodeSpawn, retry_attempt};
use super::graph::{GraphError, validate_graph};
use super::resume::{IdentityStrategy, ResumeError};
use super::step::{StepContext, StepOutcome, StepRegistry};
use super::transition::TransitionOutcome;
use crate::event::{ObserverFuture, PlanExecutionDeleteObserver, StatusEventBus};
use crate::notify::{Delivery, NotifyEngine, NotifyError, WaitHandle, plan_callback_id};
use crate::repository::Backend;
use crate::repository::graph::PlanGraphRepository;
use crate::repository::metadata::PlanMetadataRepository;
use crate::repository::node_execution::NodeExecutionRepository;
use crate::repository::plan_execution::PlanExecutionRepository;
use crate::retry::RetryPolicy;
use crate::service::node_execution::{NodeExecutionService, NodeTransition};
use crate::service::plan_execution::{PlanExecutionService, PlanTransition};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("plan execution {0} not found")]
    NotFound(Uuid),

    #[error("invalid plan graph: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("inconsistent execution state: {0}")]
    Structural(String),

    #[error("timed out waiting for plan execution {0}")]
    Timeout(Uuid),
}

/// Caller-supplied context for a new plan execution.
#[derive(Debug, Clone, Default)]
pub struct PlanSeed {
    pub setup_abstractions: BTreeMap<String, String>,
    pub metadata: ExecutionMetadata,
    pub governance_metadata: Option<serde_json::Value>,
    pub notes: Option<String>,
}

pub struct OrchestratorBuilder<B: Backend> {
    backend: Arc<B>,
    config: EngineConfig,
    steps: StepRegistry,
    adviser: Option<BoxAdviser>,
    bus: Option<StatusEventBus>,
    caches: Arc<PlanCaches>,
}

impl<B: Backend> OrchestratorBuilder<B> {
    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn adviser(mut self, adviser: BoxAdviser) -> Self {
        self.adviser = Some(adviser);
        self
    }

    pub fn bus(mut self, bus: StatusEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Delete observer dropping the in-process state of purged plans. Register
    /// it on the bus handed to [`Self::bus`].
    pub fn cache_evictor(&self) -> PlanCacheEvictor {
        PlanCacheEvictor {
            caches: Arc::clone(&self.caches),
        }
    }

    pub fn build(self) -> Arc<Orchestrator<B>> {
        let retry = RetryPolicy::from_config(&self.config.retry);
        let bus = self
            .bus
            .unwrap_or_else(|| StatusEventBus::new(self.config.events.channel_capacity));
        let notify = Arc::new(NotifyEngine::new(self.backend.clone()));
        let ttl = chrono::Duration::days(i64::from(self.config.retention.ttl_days));

        Arc::new(Orchestrator {
            plans: Arc::new(PlanExecutionService::new(
                self.backend.clone(),
                bus.clone(),
                notify.clone(),
                retry,
                self.config.lock.clone(),
            )),
            nodes: NodeExecutionService::new(self.backend.clone(), retry),
            identity: IdentityStrategy::new(self.backend.clone(), ttl),
            backend: self.backend,
            notify,
            bus,
            steps: self.steps,
            adviser: self.adviser.unwrap_or_default(),
            retry,
            ttl,
            caches: self.caches,
        })
    }
}

pub struct Orchestrator<B: Backend> {
    backend: Arc<B>,
    plans: Arc<PlanExecutionService<B>>,
    nodes: NodeExecutionService<B>,
    identity: IdentityStrategy<B>,
    notify: Arc<NotifyEngine<B>>,
    bus: StatusEventBus,
    steps: StepRegistry,
    adviser: BoxAdviser,
    retry: RetryPolicy,
    ttl: chrono::Duration,
    caches: Arc<PlanCaches>,
}

/// In-process state per plan execution, keyed by plan execution id.
#[derive(Default)]
struct PlanCaches {
    graphs: DashMap<Uuid, Arc<PlanGraph>>,
    /// Cancelled on abort and kept until the plan is purged, so no node task
    /// can pick up a fresh token for an aborted plan.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl PlanCaches {
    fn forget(&self, plan_execution_ids: &[Uuid]) {
        for id in plan_execution_ids {
            self.graphs.remove(id);
            self.cancellations.remove(id);
        }
    }
}

/// Drops the cached graph and cancellation token of plans being purged.
#[derive(Clone)]
pub struct PlanCacheEvictor {
    caches: Arc<PlanCaches>,
}

impl PlanCacheEvictor {
    /// Number of plans with in-process state.
    pub fn tracked(&self) -> usize {
        self.caches.cancellations.len().max(self.caches.graphs.len())
    }
}

impl PlanExecutionDeleteObserver for PlanCacheEvictor {
    fn name(&self) -> &str {
        "plan-cache-eviction"
    }

    fn on_plans_deleted<'a>(&'a self, plan_execution_ids: &'a [Uuid]) -> ObserverFuture<'a> {
        Box::pin(async move {
            self.caches.forget(plan_execution_ids);
            Ok(())
        })
    }
}

impl<B: Backend> Orchestrator<B> {
    pub fn builder(backend: Arc<B>, config: EngineConfig) -> OrchestratorBuilder<B> {
        OrchestratorBuilder {
            backend,
            config,
            steps: StepRegistry::with_builtins(),
            adviser: None,
            bus: None,
            caches: Arc::default(),
        }
    }

    pub fn plans(&self) -> &Arc<PlanExecutionService<B>> {
        &self.plans
    }

    pub fn nodes(&self) -> &NodeExecutionService<B> {
        &self.nodes
    }

    pub fn notify(&self) -> &NotifyEngine<B> {
        &self.notify
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    // -----------------------------------------------------------------------
    // Facade
    // -----------------------------------------------------------------------

    /// Validate and store `graph`, create the plan execution and start it.
    pub async fn submit_plan(
        self: &Arc<Self>,
        graph: PlanGraph,
        seed: PlanSeed,
    ) -> Result<Uuid, EngineError> {
        validate_graph(&graph)?;
        let root = graph
            .root()
            .cloned()
            .ok_or_else(|| GraphError::MissingRoot(graph.root_node_id.clone()))?;
        self.retry
            .run_repo("save_graph", || self.backend.graphs().save_graph(&graph))
            .await?;

        let now = Utc::now();
        let valid_until = now + self.ttl;
        let mut metadata = seed.metadata;
        if metadata.pipeline_identifier.is_empty() {
            metadata.pipeline_identifier = root.identifier.clone();
        }
        let plan = PlanExecution {
            id: Uuid::now_v7(),
            plan_id: graph.plan_id,
            status: Status::Running,
            created_at: now,
            last_updated_at: now,
            start_ts: now,
            end_ts: None,
            setup_abstractions: seed.setup_abstractions,
            metadata,
            governance_metadata: seed.governance_metadata,
            valid_until: Some(valid_until),
        };

        self.plans.create(&plan).await?;
        let plan_metadata = PlanExecutionMetadata {
            plan_execution_id: plan.id,
            notes: seed.notes.clone(),
            retry_stages_metadata: None,
            created_at: now,
            valid_until: Some(valid_until),
        };
        self.retry
            .run_repo("save_metadata", || {
                self.backend.metadata().save_metadata(&plan_metadata)
            })
            .await?;

        let plan_ambiance = Ambiance::new(
            plan.id,
            plan.setup_abstractions.clone(),
            plan.metadata.clone(),
        );
        let root_node = NodeSpawn {
            parent_ambiance: &plan_ambiance,
            plan_node: &root,
            parent_id: None,
            previous_id: None,
            notify_id: None,
            runtime_idx: 0,
            retry_index: 0,
            valid_until: Some(valid_until),
        }
        .queued_node();
        self.nodes.create(&root_node).await?;

        self.caches.graphs.insert(plan.id, Arc::new(graph));
        self.plan_token(&plan.id);
        tracing::info!(
            plan_execution_id = %plan.id,
            plan_id = %plan.plan_id,
            root = %root.id,
            "plan execution submitted"
        );
        self.spawn_node(plan.id, root_node.id, Duration::ZERO);
        Ok(plan.id)
    }

    /// Re-run `stages` of a finished plan execution as a new execution.
    pub async fn resume_plan(
        self: &Arc<Self>,
        original_id: &Uuid,
        stages: &BTreeSet<String>,
    ) -> Result<Uuid, EngineError> {
        let resumed = self.identity.build_resumed_plan(original_id, stages).await?;
        let head = resumed
            .nodes
            .iter()
            .find(|n| n.parent_id.is_none() && n.previous_id.is_none())
            .map(|n| n.id)
            .ok_or_else(|| EngineError::Structural(format!("plan {original_id} has no nodes")))?;

        self.plans.create(&resumed.plan).await?;
        self.identity.persist(&resumed).await?;
        self.plan_token(&resumed.plan.id);

        tracing::info!(
            original_plan_execution_id = %original_id,
            plan_execution_id = %resumed.plan.id,
            identity_nodes = resumed.identity_count(),
            "plan execution resumed"
        );
        self.spawn_node(resumed.plan.id, head, Duration::ZERO);
        Ok(resumed.plan.id)
    }

    /// Abort a plan execution top-down. Returns the plan's resulting status.
    ///
    /// The DISCONTINUING write is the gate: a plan that is already final is
    /// left untouched and its status returned.
    pub async fn abort(&self, plan_execution_id: &Uuid) -> Result<Status, EngineError> {
        let gate = self
            .plans
            .update_status(plan_execution_id, PlanTransition::to(Status::Discontinuing))
            .await?;
        if let TransitionOutcome::Stale = gate {
            let status = self.get_status(plan_execution_id).await?;
            tracing::info!(plan_execution_id = %plan_execution_id, status = %status, "abort ignored, plan already final");
            return Ok(status);
        }

        self.plan_token(plan_execution_id).cancel();

        let active = self
            .nodes
            .with_status(plan_execution_id, Status::FINAL.complement())
            .await?;
        for node in active {
            for response in &node.executable_responses {
                if let ExecutableResponse::Async { callback_ids } = response {
                    for id in callback_ids {
                        self.notify.cancel(id);
                    }
                }
            }
            self.nodes
                .update_status(
                    &node.id,
                    NodeTransition::to(Status::Aborted)
                        .with_update(NodeExecutionUpdate::ended(Utc::now()))
                        .forced(),
                )
                .await?;
        }

        self.plans
            .update_status(
                plan_execution_id,
                PlanTransition::to(Status::Aborted)
                    .with_update(PlanExecutionUpdate::ended(Utc::now()))
                    .forced(),
            )
            .await?;
        tracing::info!(plan_execution_id = %plan_execution_id, "plan execution aborted");
        Ok(Status::Aborted)
    }

    pub async fn get_status(&self, plan_execution_id: &Uuid) -> Result<Status, EngineError> {
        match self.plans.get_status(plan_execution_id).await {
            Err(RepositoryError::NotFound) => Err(EngineError::NotFound(*plan_execution_id)),
            other => Ok(other?),
        }
    }

    /// Hand the result of an externally executed step to the waiting node.
    pub async fn deliver_step_result(
        &self,
        correlation_id: &str,
        response: StepResponse,
    ) -> Result<Delivery, EngineError> {
        Ok(self
            .notify
            .deliver(correlation_id, NotifyPayload::StepResult(response))
            .await?)
    }

    /// Wait until the plan reaches a final status.
    pub async fn await_plan(
        &self,
        plan_execution_id: &Uuid,
        timeout: Duration,
    ) -> Result<Status, EngineError> {
        let status = self.get_status(plan_execution_id).await?;
        if status.is_final() {
            return Ok(status);
        }

        let handle = match self.notify.register(&plan_callback_id(plan_execution_id)).await {
            Ok(handle) => handle,
            Err(NotifyError::AlreadyConsumed(_)) => return self.get_status(plan_execution_id).await,
            Err(e) => return Err(e.into()),
        };
        match handle.wait_timeout(timeout).await {
            Ok(NotifyPayload::PlanFinished { status, .. }) => Ok(status),
            Ok(_) => self.get_status(plan_execution_id).await,
            Err(NotifyError::Timeout(_)) => Err(EngineError::Timeout(*plan_execution_id)),
            // Replaced by a later waiter on the same plan.
            Err(NotifyError::Cancelled(_)) => self.get_status(plan_execution_id).await,
            Err(e) => Err(e.into()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanStatusEvent> {
        self.bus.subscribe()
    }

    /// Force the plan into ERRORED and stop its remaining node tasks.
    pub async fn mark_plan_errored(&self, plan_execution_id: &Uuid) -> Result<(), EngineError> {
        self.plans.mark_errored(plan_execution_id).await?;
        self.plan_token(plan_execution_id).cancel();
        Ok(())
    }

    /// Pick up work left behind by a driver that went away, e.g. after a
    /// restart: re-attach waiters for nodes parked on a callback, let
    /// RUNNING composite nodes wait on their children again and run
    /// interrupted leaf steps once more.
    ///
    /// Assumes no other live engine is driving the same plans. Returns the
    /// number of callbacks and nodes picked up.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, EngineError> {
        let parked_statuses = Status::BLOCKING.with(Status::AsyncWaiting);
        let fields = [NodeExecutionField::ExecutableResponses];
        let mut parked = Vec::new();
        {
            let mut stream = self
                .backend
                .nodes()
                .find_nodes_by_status(parked_statuses, &fields);
            while let Some(node) = stream.next().await {
                parked.push(node?);
            }
        }

        let mut recovered = 0;
        for node in parked {
            let callback_ids = node
                .executable_responses
                .unwrap_or_default()
                .into_iter()
                .rev()
                .find_map(|r| match r {
                    ExecutableResponse::Async { callback_ids } => Some(callback_ids),
                    _ => None,
                })
                .unwrap_or_default();
            for callback_id in callback_ids {
                match self.notify.register(&callback_id).await {
                    Ok(handle) => {
                        self.spawn_waiter(node.plan_execution_id, node.id, callback_id, handle);
                        recovered += 1;
                    }
                    Err(NotifyError::AlreadyConsumed(id)) => {
                        tracing::warn!(node_execution_id = %node.id, callback_id = %id, "callback already consumed, not recovered");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let interrupted = {
            let fields = [NodeExecutionField::Mode];
            let mut stream = self
                .backend
                .nodes()
                .find_nodes_by_status(StatusSet::of(&[Status::Running]), &fields);
            let mut interrupted = Vec::new();
            while let Some(node) = stream.next().await {
                interrupted.push(node?);
            }
            interrupted
        };
        for node in interrupted {
            self.spawn_redrive(node.plan_execution_id, node.id);
            recovered += 1;
        }

        tracing::info!(recovered, "left-behind work recovered");
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Node lifecycle
    // -----------------------------------------------------------------------

    fn spawn_node(self: &Arc<Self>, plan_execution_id: Uuid, node_execution_id: Uuid, delay: Duration) {
        let this = Arc::clone(self);
        let span = tracing::info_span!(
            "node",
            plan_execution_id = %plan_execution_id,
            node_execution_id = %node_execution_id,
            node_id = tracing::field::Empty,
        );
        tokio::spawn(
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Err(e) = this.run_node(node_execution_id).await {
                    tracing::error!(error = %e, "node execution failed");
                    this.give_up_if_structural(&plan_execution_id, &e).await;
                }
            }
            .instrument(span),
        );
    }

    fn spawn_redrive(self: &Arc<Self>, plan_execution_id: Uuid, node_execution_id: Uuid) {
        let this = Arc::clone(self);
        let span = tracing::info_span!(
            "node",
            plan_execution_id = %plan_execution_id,
            node_execution_id = %node_execution_id,
            node_id = tracing::field::Empty,
        );
        tokio::spawn(
            async move {
                if let Err(e) = this.redrive(node_execution_id).await {
                    tracing::error!(error = %e, "node recovery failed");
                    this.give_up_if_structural(&plan_execution_id, &e).await;
                }
            }
            .instrument(span),
        );
    }

    /// A node tree that no longer matches its graph cannot make progress and
    /// the sweep cannot repair it, so the plan is ended ERRORED.
    async fn give_up_if_structural(&self, plan_execution_id: &Uuid, error: &EngineError) {
        if !matches!(error, EngineError::Structural(_)) {
            return;
        }
        if let Err(e) = self.mark_plan_errored(plan_execution_id).await {
            tracing::error!(error = %e, "could not mark plan execution errored");
        }
    }

    async fn redrive(self: &Arc<Self>, node_execution_id: Uuid) -> Result<(), EngineError> {
        let node = self.nodes.get(&node_execution_id).await?;
        tracing::Span::current().record("node_id", node.node_id.as_str());
        if node.status != Status::Running {
            return Ok(());
        }
        let plan_node = self.plan_node(&node).await?;
        if plan_node.mode.is_composite() {
            self.drive_children(node, &plan_node).await
        } else {
            // At-least-once: the handler may already have had side effects.
            tracing::warn!(step_type = %plan_node.step_type, "step was interrupted, running it again");
            self.run_leaf(node, &plan_node).await
        }
    }

    async fn run_node(self: &Arc<Self>, node_execution_id: Uuid) -> Result<(), EngineError> {
        let node = self.nodes.get(&node_execution_id).await?;
        tracing::Span::current().record("node_id", node.node_id.as_str());
        let plan_node = self.plan_node(&node).await?;

        // Identity nodes (and anything else already final) only advance.
        if node.status.is_final() {
            return self.advise_and_advance(node, &plan_node).await;
        }

        if !self.accepts_work(&node.plan_execution_id).await? {
            tracing::debug!("plan no longer accepts work, node not started");
            self.nodes
                .update_status(
                    &node.id,
                    NodeTransition::to(Status::Aborted)
                        .with_update(NodeExecutionUpdate::ended(Utc::now()))
                        .from_any_of(StatusSet::of(&[Status::Queued])),
                )
                .await?;
            return Ok(());
        }

        let started = self
            .nodes
            .update_status(
                &node.id,
                NodeTransition::to(Status::Running)
                    .with_update(NodeExecutionUpdate {
                        start_ts: Some(Utc::now()),
                        ..Default::default()
                    })
                    .from_any_of(StatusSet::of(&[Status::Queued])),
            )
            .await?;
        let Some(node) = started.applied() else {
            return Ok(());
        };

        if plan_node.mode.is_composite() {
            self.run_composite(node, &plan_node).await
        } else {
            self.run_leaf(node, &plan_node).await
        }
    }

    async fn run_leaf(
        self: &Arc<Self>,
        node: NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<(), EngineError> {
        let ctx = StepContext {
            ambiance: node.ambiance.clone(),
            node_execution_id: node.id,
            node: plan_node.clone(),
            callback_id: new_correlation_id(),
            cancel: self.plan_token(&node.plan_execution_id),
            attempt: node.retry_index,
        };

        let outcome = match self.steps.get(&plan_node.step_type) {
            Ok(handler) => handler.start(&ctx).await,
            Err(e) => Err(e),
        };
        let response = match outcome {
            Ok(StepOutcome::Completed(response)) if response.status.is_final() => {
                self.nodes
                    .update(
                        &node.id,
                        NodeExecutionUpdate {
                            executable_response: Some(ExecutableResponse::Sync),
                            ..Default::default()
                        },
                    )
                    .await?;
                response
            }
            Ok(StepOutcome::Completed(response)) => {
                return self.park(node, ctx.callback_id, response.status).await;
            }
            Ok(StepOutcome::Waiting { status }) => {
                return self.park(node, ctx.callback_id, status).await;
            }
            Err(e) => {
                tracing::warn!(step_type = %plan_node.step_type, error = %e, "step handler failed");
                StepResponse {
                    status: Status::Failed,
                    outputs: None,
                    failure_info: Some(FailureInfo {
                        message: e.to_string(),
                        error_code: Some("STEP_HANDLER_ERROR".to_string()),
                    }),
                }
            }
        };
        self.on_response(node, plan_node, response).await
    }

    /// Park `node` on `callback_id` in a waiting status.
    async fn park(
        self: &Arc<Self>,
        node: NodeExecution,
        callback_id: String,
        status: Status,
    ) -> Result<(), EngineError> {
        let status = if status.is_blocking() {
            status
        } else {
            Status::AsyncWaiting
        };
        let handle = self.notify.register(&callback_id).await?;

        let parked = self
            .nodes
            .update_status(
                &node.id,
                NodeTransition::to(status).with_update(NodeExecutionUpdate {
                    executable_response: Some(ExecutableResponse::Async {
                        callback_ids: vec![callback_id.clone()],
                    }),
                    ..Default::default()
                }),
            )
            .await?;
        let Some(node) = parked.applied() else {
            self.notify.cancel(&callback_id);
            return Ok(());
        };
        tracing::debug!(callback_id = %callback_id, status = %status, "node parked");

        if status.is_blocking() {
            self.plans.on_node_blocked(&node.plan_execution_id).await?;
        }
        self.spawn_waiter(node.plan_execution_id, node.id, callback_id, handle);
        Ok(())
    }

    fn spawn_waiter(
        self: &Arc<Self>,
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        callback_id: String,
        handle: WaitHandle,
    ) {
        let this = Arc::clone(self);
        let cancel = self.plan_token(&plan_execution_id);
        let span = tracing::info_span!(
            "node",
            plan_execution_id = %plan_execution_id,
            node_execution_id = %node_execution_id,
            node_id = tracing::field::Empty,
        );
        tokio::spawn(
            async move {
                let payload = tokio::select! {
                    payload = handle.wait() => payload,
                    _ = cancel.cancelled() => {
                        this.notify.cancel(&callback_id);
                        return;
                    }
                };
                let result = match payload {
                    Ok(payload) => this.resume_node(node_execution_id, payload).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    tracing::error!(callback_id = %callback_id, error = %e, "node resume failed");
                }
            }
            .instrument(span),
        );
    }

    /// Continue a parked node with the payload delivered to its callback.
    async fn resume_node(
        self: &Arc<Self>,
        node_execution_id: Uuid,
        payload: NotifyPayload,
    ) -> Result<(), EngineError> {
        let node = self.nodes.get(&node_execution_id).await?;
        tracing::Span::current().record("node_id", node.node_id.as_str());
        let response = match payload {
            NotifyPayload::StepResult(response) => response,
            NotifyPayload::Aborted => StepResponse::new(Status::Aborted),
            other => {
                tracing::warn!(payload = ?other, "unexpected payload for a parked node");
                return Ok(());
            }
        };
        if node.status.is_final() {
            tracing::debug!(status = %node.status, "late response for a finished node ignored");
            return Ok(());
        }

        let previous = node.status;
        let node = if previous == Status::Running {
            node
        } else {
            let resumed = self
                .nodes
                .update_status(&node.id, NodeTransition::to(Status::Running))
                .await?;
            let Some(node) = resumed.applied() else {
                return Ok(());
            };
            node
        };
        if !previous.is_flowing() {
            self.plans
                .recompute_running_status(&node.plan_execution_id, None)
                .await?;
        }

        let plan_node = self.plan_node(&node).await?;
        self.on_response(node, &plan_node, response).await
    }

    async fn on_response(
        self: &Arc<Self>,
        node: NodeExecution,
        plan_node: &PlanNode,
        response: StepResponse,
    ) -> Result<(), EngineError> {
        if !response.status.is_final() {
            return self.park(node, new_correlation_id(), response.status).await;
        }

        let update = NodeExecutionUpdate {
            end_ts: Some(Utc::now()),
            failure_info: response.failure_info,
            outputs: response.outputs,
            ..Default::default()
        };
        let finished = self
            .nodes
            .update_status(&node.id, NodeTransition::to(response.status).with_update(update))
            .await?;
        let Some(node) = finished.applied() else {
            return Ok(());
        };
        tracing::info!(status = %node.status, "node finished");
        self.advise_and_advance(node, plan_node).await
    }

    async fn advise_and_advance(
        self: &Arc<Self>,
        node: NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<(), EngineError> {
        let advice = match self.adviser.advise(&node, plan_node) {
            Ok(advice) => advice,
            Err(e) => {
                tracing::error!(error = %e, "adviser failed, node left as is");
                return Ok(());
            }
        };
        let node = self
            .nodes
            .update(
                &node.id,
                NodeExecutionUpdate {
                    adviser_response: Some(advice.clone()),
                    ..Default::default()
                },
            )
            .await?;

        match advice {
            AdviserResponse::NextStep { next_node_id } => {
                self.start_sibling(&node, &next_node_id).await
            }
            AdviserResponse::Retry {
                wait_ms,
                retry_index,
            } => {
                let superseded = self.nodes.supersede(&node).await?;
                let attempt = retry_attempt(&node, plan_node, retry_index);
                self.nodes.create(&attempt).await?;
                tracing::info!(retry_index, wait_ms, superseded, "retrying node");
                self.spawn_node(
                    node.plan_execution_id,
                    attempt.id,
                    Duration::from_millis(wait_ms),
                );
                Ok(())
            }
            AdviserResponse::MarkSuccess => {
                self.override_and_continue(node, plan_node, Status::Succeeded)
                    .await
            }
            AdviserResponse::IgnoreFailure => {
                self.override_and_continue(node, plan_node, Status::IgnoreFailed)
                    .await
            }
            AdviserResponse::End => self.end_node(&node).await,
        }
    }

    /// Replace a broken outcome with `status` and move on as if it succeeded.
    async fn override_and_continue(
        self: &Arc<Self>,
        node: NodeExecution,
        plan_node: &PlanNode,
        status: Status,
    ) -> Result<(), EngineError> {
        let overridden = self
            .nodes
            .update_status(
                &node.id,
                NodeTransition::to(status).from_any_of(Status::BROKEN),
            )
            .await?;
        let Some(node) = overridden.applied() else {
            return Ok(());
        };
        match next_or_end(plan_node) {
            AdviserResponse::NextStep { next_node_id } => {
                self.start_sibling(&node, &next_node_id).await
            }
            _ => self.end_node(&node).await,
        }
    }

    async fn start_sibling(
        self: &Arc<Self>,
        current: &NodeExecution,
        next_node_id: &str,
    ) -> Result<(), EngineError> {
        if !self.accepts_work(&current.plan_execution_id).await? {
            tracing::debug!(next_node_id, "plan no longer accepts work, sibling not created");
            return Ok(());
        }
        let graph = self.graph(&current.plan_execution_id).await?;
        let plan_node = graph.node(next_node_id).ok_or_else(|| {
            EngineError::Structural(format!("next node '{next_node_id}' is not in the graph"))
        })?;

        let existing = self
            .nodes
            .find_existing(
                &current.plan_execution_id,
                current.parent_id.as_ref(),
                next_node_id,
            )
            .await?;
        let sibling = match existing {
            Some(sibling) if sibling.notify_id == current.notify_id => sibling,
            Some(sibling) => {
                self.nodes
                    .update(
                        &sibling.id,
                        NodeExecutionUpdate {
                            notify_id: current.notify_id.clone(),
                            ..Default::default()
                        },
                    )
                    .await?
            }
            None => {
                let parent_ambiance = current.ambiance.clone_for_finish();
                let sibling = NodeSpawn {
                    parent_ambiance: &parent_ambiance,
                    plan_node,
                    parent_id: current.parent_id,
                    previous_id: Some(current.id),
                    notify_id: current.notify_id.clone(),
                    runtime_idx: 0,
                    retry_index: 0,
                    valid_until: current.valid_until,
                }
                .queued_node();
                self.nodes.create(&sibling).await?;
                sibling
            }
        };
        self.spawn_node(current.plan_execution_id, sibling.id, Duration::ZERO);
        Ok(())
    }

    /// A chain finished at `node`: wake the parent, or end the plan.
    async fn end_node(&self, node: &NodeExecution) -> Result<(), EngineError> {
        match &node.notify_id {
            Some(notify_id) => {
                let payload = NotifyPayload::NodeFinished {
                    node_execution_id: node.id,
                    status: node.status,
                    adviser_response: node.adviser_response.clone(),
                    end_ts: node.end_ts.unwrap_or_else(Utc::now),
                };
                self.notify.deliver(notify_id, payload).await?;
                Ok(())
            }
            None => self.end_plan(&node.plan_execution_id).await,
        }
    }

    async fn end_plan(&self, plan_execution_id: &Uuid) -> Result<(), EngineError> {
        self.nodes.skip_unreached(plan_execution_id, None).await?;
        let status = self.plans.calculate_status(plan_execution_id).await?;
        if !status.is_final() {
            tracing::debug!(plan_execution_id = %plan_execution_id, status = %status, "plan still has active nodes");
            return Ok(());
        }
        self.plans
            .update_status(
                plan_execution_id,
                PlanTransition::to(status).with_update(PlanExecutionUpdate::ended(Utc::now())),
            )
            .await?;
        self.caches.forget(&[*plan_execution_id]);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Composite modes
    // -----------------------------------------------------------------------

    async fn run_composite(
        self: &Arc<Self>,
        node: NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<(), EngineError> {
        let dispatched = match plan_node.mode {
            ExecutionMode::Child => ExecutableResponse::Child {
                child_node_id: plan_node.children.first().cloned().unwrap_or_default(),
            },
            ExecutionMode::Children => ExecutableResponse::Children {
                child_node_ids: plan_node.children.clone(),
                max_concurrency: plan_node.max_concurrency,
            },
            _ => ExecutableResponse::ChildChain {
                child_node_ids: plan_node.children.clone(),
            },
        };
        self.nodes
            .update(
                &node.id,
                NodeExecutionUpdate {
                    executable_response: Some(dispatched),
                    ..Default::default()
                },
            )
            .await?;
        self.drive_children(node, plan_node).await
    }

    /// Run (or re-attach to) the children of a RUNNING composite node and
    /// finish it with their aggregate.
    async fn drive_children(
        self: &Arc<Self>,
        node: NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<(), EngineError> {
        let graph = self.graph(&node.plan_execution_id).await?;
        let children = plan_node
            .children
            .iter()
            .map(|id| {
                graph.node(id).ok_or_else(|| {
                    EngineError::Structural(format!("child node '{id}' is not in the graph"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let cancel = self.plan_token(&node.plan_execution_id);

        let completed = match plan_node.mode {
            ExecutionMode::Children => {
                self.run_children(&node, &children, plan_node.max_concurrency, &cancel)
                    .await?
            }
            _ => self.run_chain(&node, &children, &cancel).await?,
        };
        if !completed {
            tracing::debug!("composite node cancelled");
            return Ok(());
        }

        self.nodes
            .skip_unreached(&node.plan_execution_id, Some(&node.id))
            .await?;
        let statuses = self
            .nodes
            .children_statuses(&node.plan_execution_id, &node.id)
            .await?;
        let status = aggregate(&statuses);
        if !status.is_final() {
            tracing::warn!(status = %status, "children settled in a non-final aggregate");
            return Ok(());
        }
        let mut response = StepResponse::new(status);
        if status.is_broken() {
            response.failure_info = Some(FailureInfo::new(format!("child execution ended {status}")));
        }
        self.on_response(node, plan_node, response).await
    }

    /// Run children one after another, stopping after a broken one. Each
    /// child follows the execution that finished the child before it.
    /// Returns `false` when the plan was cancelled.
    async fn run_chain(
        self: &Arc<Self>,
        parent: &NodeExecution,
        children: &[&PlanNode],
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let mut previous_id = None;
        for (idx, child) in children.iter().enumerate() {
            let Some(handle) = self
                .launch_child(parent, child, idx as u32, previous_id)
                .await?
            else {
                return Ok(false);
            };
            let payload = tokio::select! {
                payload = handle.wait() => payload?,
                _ = cancel.cancelled() => return Ok(false),
            };
            if let NotifyPayload::NodeFinished {
                node_execution_id,
                status,
                ..
            } = payload
            {
                previous_id = Some(node_execution_id);
                if status.is_broken() {
                    break;
                }
            }
        }
        Ok(true)
    }

    /// Run children concurrently, at most `max_concurrency` at a time.
    async fn run_children(
        self: &Arc<Self>,
        parent: &NodeExecution,
        children: &[&PlanNode],
        max_concurrency: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let limit = max_concurrency.unwrap_or(children.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut join_set = JoinSet::new();

        for (idx, child) in children.iter().enumerate() {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| EngineError::Structural(e.to_string()))?,
                _ = cancel.cancelled() => return Ok(false),
            };
            let Some(handle) = self.launch_child(parent, child, idx as u32, None).await? else {
                return Ok(false);
            };
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let result = tokio::select! {
                    payload = handle.wait() => payload.map(Some),
                    _ = cancel.cancelled() => Ok(None),
                };
                drop(permit);
                result
            });
        }

        let mut completed = true;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) => completed = false,
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(EngineError::Structural(format!("child waiter panicked: {e}"))),
            }
        }
        Ok(completed)
    }

    /// Create (or reuse) a child execution, register its notify id and start it.
    ///
    /// `None` when the plan no longer accepts work.
    async fn launch_child(
        self: &Arc<Self>,
        parent: &NodeExecution,
        child: &PlanNode,
        runtime_idx: u32,
        previous_id: Option<Uuid>,
    ) -> Result<Option<WaitHandle>, EngineError> {
        if !self.accepts_work(&parent.plan_execution_id).await? {
            tracing::debug!(child = %child.id, "plan no longer accepts work, child not launched");
            return Ok(None);
        }
        let existing = self
            .nodes
            .find_existing(&parent.plan_execution_id, Some(&parent.id), &child.id)
            .await?;
        if let Some(node) = existing {
            return self.relaunch_child(node).await.map(Some);
        }

        let notify_id = new_correlation_id();
        let handle = self.notify.register(&notify_id).await?;
        let node = NodeSpawn {
            parent_ambiance: &parent.ambiance,
            plan_node: child,
            parent_id: Some(parent.id),
            previous_id,
            notify_id: Some(notify_id),
            runtime_idx,
            retry_index: 0,
            valid_until: parent.valid_until,
        }
        .queued_node();
        self.nodes.create(&node).await?;
        self.spawn_node(parent.plan_execution_id, node.id, Duration::ZERO);
        Ok(Some(handle))
    }

    /// Wait on an existing child again. Its notify id is kept while still
    /// open, so a finish delivered while nobody was waiting is picked up.
    async fn relaunch_child(self: &Arc<Self>, node: NodeExecution) -> Result<WaitHandle, EngineError> {
        let open = match &node.notify_id {
            Some(notify_id) => match self.notify.register(notify_id).await {
                Ok(handle) => Some(handle),
                Err(NotifyError::AlreadyConsumed(_)) => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        let handle = match open {
            Some(handle) => handle,
            None => {
                let notify_id = new_correlation_id();
                let handle = self.notify.register(&notify_id).await?;
                self.nodes
                    .update(
                        &node.id,
                        NodeExecutionUpdate {
                            notify_id: Some(notify_id),
                            ..Default::default()
                        },
                    )
                    .await?;
                handle
            }
        };
        self.spawn_node(node.plan_execution_id, node.id, Duration::ZERO);
        Ok(handle)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    async fn graph(&self, plan_execution_id: &Uuid) -> Result<Arc<PlanGraph>, EngineError> {
        if let Some(graph) = self.caches.graphs.get(plan_execution_id) {
            return Ok(Arc::clone(graph.value()));
        }
        let plan_id = self
            .backend
            .plans()
            .get_plan_projection(plan_execution_id, &[PlanExecutionField::PlanId])
            .await?
            .and_then(|p| p.plan_id)
            .ok_or(EngineError::NotFound(*plan_execution_id))?;
        let graph = self
            .backend
            .graphs()
            .get_graph(&plan_id)
            .await?
            .ok_or_else(|| EngineError::Structural(format!("plan graph {plan_id} is missing")))?;
        let graph = Arc::new(graph);
        self.caches.graphs.insert(*plan_execution_id, Arc::clone(&graph));
        Ok(graph)
    }

    async fn plan_node(&self, node: &NodeExecution) -> Result<PlanNode, EngineError> {
        self.graph(&node.plan_execution_id)
            .await?
            .node(&node.node_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::Structural(format!("node '{}' is not in the plan graph", node.node_id))
            })
    }

    fn plan_token(&self, plan_execution_id: &Uuid) -> CancellationToken {
        self.caches
            .cancellations
            .entry(*plan_execution_id)
            .or_default()
            .clone()
    }

    /// Whether new nodes may still start: the plan is not cancelled in this
    /// process and is neither final nor DISCONTINUING.
    async fn accepts_work(&self, plan_execution_id: &Uuid) -> Result<bool, EngineError> {
        if self.plan_token(plan_execution_id).is_cancelled() {
            return Ok(false);
        }
        let status = self.get_status(plan_execution_id).await?;
        Ok(!status.is_final() && status != Status::Discontinuing)
    }
}

fn new_correlation_id() -> String {
    Uuid::now_v7().to_string()
}
