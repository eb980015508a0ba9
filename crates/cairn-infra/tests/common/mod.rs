//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use cairn_core::execution::step::{StepContext, StepError, StepHandler, StepOutcome, StepRegistry};
use cairn_core::execution::Orchestrator;
use cairn_core::repository::Backend;
use cairn_infra::MemoryBackend;
use cairn_types::config::{EngineConfig, LockConfig, RetryConfig};
use cairn_types::graph::{ExecutionMode, FailureStrategy, PlanGraph, PlanNode, StepCategory};
use cairn_types::node::{ExecutableResponse, NodeExecution, StepResponse};
use cairn_types::status::{Status, StatusSet};

pub const WAIT: Duration = Duration::from_secs(5);

/// Config with short lock waits and fast persistence retries.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        lock: LockConfig {
            wait_secs: 2,
            lease_secs: 5,
            poll_interval_ms: 5,
        },
        retry: RetryConfig {
            max_attempts: 3,
            backoff_ms: 1,
            max_backoff_ms: 10,
        },
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Spy step
// ---------------------------------------------------------------------------

/// Records every invocation by graph node id.
///
/// Parameters:
/// - `fail_times`: fail this many invocations of the node before succeeding
/// - `fail_calls`: fail exactly these invocations (1-based)
/// - `delay_ms`: sleep before answering
/// - `outputs`: returned on success
#[derive(Debug, Clone, Default)]
pub struct SpyStep {
    calls: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SpyStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, node_id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == node_id).count()
    }

    /// Most invocations observed in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl StepHandler for SpyStep {
    fn step_type(&self) -> &str {
        "spy"
    }

    async fn start(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ctx.node.id.clone());
            calls.iter().filter(|c| **c == ctx.node.id).count()
        };

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(ms) = ctx.parameter("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let fail_times = ctx
            .parameter("fail_times")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let fail_call = ctx
            .parameter("fail_calls")
            .and_then(Value::as_array)
            .is_some_and(|calls| calls.iter().any(|c| c.as_u64() == Some(seen as u64)));
        if seen <= fail_times || fail_call {
            return Ok(StepOutcome::Completed(StepResponse::failed(format!(
                "{} failed on call {seen}",
                ctx.node.id
            ))));
        }
        let outputs = ctx.parameter("outputs").cloned().unwrap_or(Value::Null);
        Ok(StepOutcome::Completed(StepResponse::succeeded(outputs)))
    }
}

pub fn registry_with(spy: &SpyStep) -> StepRegistry {
    let mut registry = StepRegistry::with_builtins();
    registry.register(spy.clone());
    registry
}

pub fn memory_engine(spy: &SpyStep) -> Arc<Orchestrator<MemoryBackend>> {
    engine_over(Arc::new(MemoryBackend::new()), spy)
}

pub fn engine_over<B: Backend>(backend: Arc<B>, spy: &SpyStep) -> Arc<Orchestrator<B>> {
    Orchestrator::builder(backend, test_config())
        .steps(registry_with(spy))
        .build()
}

// ---------------------------------------------------------------------------
// Graph builders
// ---------------------------------------------------------------------------

pub fn step(id: &str, step_type: &str) -> PlanNode {
    PlanNode {
        id: id.into(),
        identifier: format!("{id}_ident"),
        name: id.to_uppercase(),
        step_type: step_type.into(),
        step_category: StepCategory::Step,
        mode: ExecutionMode::Sync,
        children: vec![],
        max_concurrency: None,
        next_node_id: None,
        failure_strategy: FailureStrategy::Fail,
        parameters: json!({}),
    }
}

pub fn composite(id: &str, category: StepCategory, mode: ExecutionMode, children: &[&str]) -> PlanNode {
    PlanNode {
        step_category: category,
        mode,
        children: children.iter().map(|c| c.to_string()).collect(),
        step_type: String::new(),
        ..step(id, "")
    }
}

pub fn with_next(mut node: PlanNode, next: &str) -> PlanNode {
    node.next_node_id = Some(next.into());
    node
}

pub fn with_params(mut node: PlanNode, parameters: Value) -> PlanNode {
    node.parameters = parameters;
    node
}

pub fn with_strategy(mut node: PlanNode, strategy: FailureStrategy) -> PlanNode {
    node.failure_strategy = strategy;
    node
}

pub fn graph(root: &str, nodes: Vec<PlanNode>) -> PlanGraph {
    PlanGraph {
        plan_id: Uuid::now_v7(),
        root_node_id: root.into(),
        nodes,
    }
}

/// Top-level chain `n1 -> n2 -> ...` of spy steps.
pub fn linear(steps: Vec<PlanNode>) -> PlanGraph {
    let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
    let nodes = steps
        .into_iter()
        .enumerate()
        .map(|(i, node)| match ids.get(i + 1) {
            Some(next) => with_next(node, next),
            None => node,
        })
        .collect();
    graph(&ids[0], nodes)
}

/// `pipeline -> stages -> (s1 -> s2 -> s3)`, each stage running one spy step.
///
/// `failing` names the stages whose step fails on its first call.
pub fn three_stage(failing: &[&str]) -> PlanGraph {
    let mut nodes = vec![
        composite("pipeline", StepCategory::Pipeline, ExecutionMode::Child, &["stages"]),
        composite("stages", StepCategory::Stages, ExecutionMode::Child, &["s1"]),
    ];
    let stages = ["s1", "s2", "s3"];
    for (i, stage) in stages.iter().enumerate() {
        let step_id = format!("{stage}_step");
        let mut stage_node = composite(stage, StepCategory::Stage, ExecutionMode::Child, &[&step_id]);
        stage_node.identifier = stage.to_string();
        if let Some(next) = stages.get(i + 1) {
            stage_node = with_next(stage_node, next);
        }
        nodes.push(stage_node);

        let fail_times = u64::from(failing.contains(stage));
        nodes.push(with_params(step(&step_id, "spy"), json!({ "fail_times": fail_times })));
    }
    graph("pipeline", nodes)
}

// ---------------------------------------------------------------------------
// Waiting helpers
// ---------------------------------------------------------------------------

/// Wait until some node of the plan sits in `status`; return it with the
/// callback id it is parked on.
pub async fn parked_node<B: Backend>(
    engine: &Orchestrator<B>,
    plan_execution_id: &Uuid,
    status: Status,
) -> (NodeExecution, String) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let nodes = engine
            .nodes()
            .with_status(plan_execution_id, StatusSet::of(&[status]))
            .await
            .unwrap();
        if let Some(node) = nodes.into_iter().next() {
            let callback = node.executable_responses.iter().rev().find_map(|r| match r {
                ExecutableResponse::Async { callback_ids } => callback_ids.first().cloned(),
                _ => None,
            });
            if let Some(callback) = callback {
                return (node, callback);
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no node reached {status} in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the plan itself reports `status`.
pub async fn plan_reaches<B: Backend>(engine: &Orchestrator<B>, plan_execution_id: &Uuid, status: Status) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while engine.get_status(plan_execution_id).await.unwrap() != status {
        assert!(
            tokio::time::Instant::now() < deadline,
            "plan never reached {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Live nodes of the plan keyed by graph node id.
pub async fn nodes_by_id<B: Backend>(
    engine: &Orchestrator<B>,
    plan_execution_id: &Uuid,
) -> HashMap<String, NodeExecution> {
    engine
        .nodes()
        .with_status(plan_execution_id, StatusSet::ALL)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| !n.old_retry)
        .map(|n| (n.node_id.clone(), n))
        .collect()
}
