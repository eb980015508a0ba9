mod common;

use std::sync::Arc;

use serde_json::json;

use cairn_core::execution::adviser::{Adviser, AdviserError, BoxAdviser, GraphAdviser};
use cairn_core::execution::{EngineError, Orchestrator, PlanSeed};
use cairn_core::notify::engine::Delivery;
use cairn_core::repository::Backend;
use cairn_core::repository::graph::PlanGraphRepository;
use cairn_core::repository::node_execution::NodeExecutionRepository;
use cairn_core::service::node_execution::NodeTransition;
use cairn_infra::MemoryBackend;
use cairn_types::graph::{ExecutionMode, FailureStrategy, PlanGraph, PlanNode, StepCategory};
use cairn_types::node::{AdviserResponse, ExecutableResponse, NodeExecution, StepResponse};
use cairn_types::status::Status;

use common::*;

#[tokio::test]
async fn failed_step_ends_the_chain_and_the_plan() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let plan = linear(vec![
        step("n1", "spy"),
        with_params(step("n2", "spy"), json!({ "fail_times": 1 })),
        step("n3", "spy"),
    ]);

    let id = engine.submit_plan(plan, PlanSeed::default()).await.unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Failed);

    assert_eq!(spy.calls(), vec!["n1", "n2"]);
    let nodes = nodes_by_id(&engine, &id).await;
    assert_eq!(nodes["n1"].status, Status::Succeeded);
    assert_eq!(nodes["n2"].status, Status::Failed);
    assert_eq!(nodes["n2"].adviser_response, Some(AdviserResponse::End));
    assert!(nodes["n2"].failure_info.is_some());
    assert!(!nodes.contains_key("n3"));

    let plan = engine.plans().get(&id).await.unwrap();
    assert!(plan.end_ts.is_some());
}

#[tokio::test]
async fn successful_chain_records_outputs_and_links() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let plan = linear(vec![
        with_params(step("n1", "spy"), json!({ "outputs": { "artifact": "a.tar" } })),
        step("n2", "noop"),
    ]);

    let id = engine.submit_plan(plan, PlanSeed::default()).await.unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);

    let nodes = nodes_by_id(&engine, &id).await;
    assert_eq!(nodes["n1"].outputs, Some(json!({ "artifact": "a.tar" })));
    assert_eq!(nodes["n2"].previous_id, Some(nodes["n1"].id));
    assert_eq!(
        nodes["n1"].adviser_response,
        Some(AdviserResponse::NextStep {
            next_node_id: "n2".into()
        })
    );
    assert!(nodes.values().all(|n| n.end_ts.is_some()));
}

#[tokio::test]
async fn unknown_step_type_fails_the_node() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let plan = linear(vec![step("n1", "does_not_exist")]);

    let id = engine.submit_plan(plan, PlanSeed::default()).await.unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Failed);

    let nodes = nodes_by_id(&engine, &id).await;
    let failure = nodes["n1"].failure_info.clone().unwrap();
    assert_eq!(failure.error_code.as_deref(), Some("STEP_HANDLER_ERROR"));
}

#[tokio::test]
async fn invalid_graph_is_rejected_before_anything_is_stored() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let plan = graph("missing", vec![step("n1", "spy")]);

    let err = engine.submit_plan(plan, PlanSeed::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::Graph(_)));
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn abort_during_async_step_aborts_plan_and_node() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let plan = linear(vec![step("n1", "wait"), step("n2", "spy")]);

    let id = engine.submit_plan(plan, PlanSeed::default()).await.unwrap();
    let (parked, callback) = parked_node(&engine, &id, Status::AsyncWaiting).await;

    assert_eq!(engine.abort(&id).await.unwrap(), Status::Aborted);
    assert_eq!(engine.get_status(&id).await.unwrap(), Status::Aborted);
    let node = engine.nodes().get(&parked.id).await.unwrap();
    assert_eq!(node.status, Status::Aborted);

    // The waiter is gone; a late result is stored but resumes nothing.
    let delivery = engine
        .deliver_step_result(&callback, StepResponse::succeeded(json!(null)))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Parked);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(engine.get_status(&id).await.unwrap(), Status::Aborted);
    assert_eq!(spy.count("n2"), 0);

    // A second abort finds the plan final and leaves it alone.
    assert_eq!(engine.abort(&id).await.unwrap(), Status::Aborted);
}

/// Takes its time deciding what follows `n1`.
struct SlowAdviser;

impl Adviser for SlowAdviser {
    fn advise(
        &self,
        node: &NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<AdviserResponse, AdviserError> {
        if node.node_id == "n1" {
            std::thread::sleep(std::time::Duration::from_millis(400));
        }
        GraphAdviser.advise(node, plan_node)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_between_siblings_starts_nothing_new() {
    let spy = SpyStep::new();
    let engine = Orchestrator::builder(Arc::new(MemoryBackend::new()), test_config())
        .steps(registry_with(&spy))
        .adviser(BoxAdviser::new(SlowAdviser))
        .build();
    let plan = linear(vec![step("n1", "spy"), step("n2", "spy")]);

    let id = engine.submit_plan(plan, PlanSeed::default()).await.unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let nodes = nodes_by_id(&engine, &id).await;
        if nodes.get("n1").is_some_and(|n| n.status == Status::Succeeded) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "n1 never finished");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    // The driver is still deciding about n1's successor.
    assert_eq!(engine.abort(&id).await.unwrap(), Status::Aborted);
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;

    assert_eq!(engine.get_status(&id).await.unwrap(), Status::Aborted);
    assert!(!nodes_by_id(&engine, &id).await.contains_key("n2"));
    assert_eq!(spy.count("n1"), 1);
    assert_eq!(spy.count("n2"), 0);
}

#[tokio::test]
async fn duplicate_delivery_resumes_once() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let plan = linear(vec![step("n1", "wait"), step("n2", "spy")]);

    let id = engine.submit_plan(plan, PlanSeed::default()).await.unwrap();
    let (_, callback) = parked_node(&engine, &id, Status::AsyncWaiting).await;

    let first = engine
        .deliver_step_result(&callback, StepResponse::succeeded(json!({ "run": 1 })))
        .await
        .unwrap();
    let second = engine
        .deliver_step_result(&callback, StepResponse::succeeded(json!({ "run": 2 })))
        .await
        .unwrap();
    assert_ne!(first, Delivery::Duplicate);
    assert_eq!(second, Delivery::Duplicate);

    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);
    assert_eq!(spy.count("n2"), 1);
    let nodes = nodes_by_id(&engine, &id).await;
    assert_eq!(nodes["n1"].outputs, Some(json!({ "run": 1 })));
}

#[tokio::test]
async fn fan_out_respects_max_concurrency() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let mut fork = composite("fork", StepCategory::Fork, ExecutionMode::Children, &["c1", "c2", "c3", "c4"]);
    fork.max_concurrency = Some(2);
    let mut nodes = vec![fork];
    for id in ["c1", "c2", "c3", "c4"] {
        nodes.push(with_params(step(id, "spy"), json!({ "delay_ms": 60 })));
    }

    let id = engine
        .submit_plan(graph("fork", nodes), PlanSeed::default())
        .await
        .unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);

    assert_eq!(spy.calls().len(), 4);
    assert!(spy.peak() <= 2, "peak concurrency was {}", spy.peak());
    let nodes = nodes_by_id(&engine, &id).await;
    let fork_id = nodes["fork"].id;
    assert!(
        ["c1", "c2", "c3", "c4"]
            .iter()
            .all(|c| nodes[*c].parent_id == Some(fork_id))
    );
}

#[tokio::test]
async fn fan_out_with_one_failure_fails_parent_after_all_children() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let nodes = vec![
        composite("fork", StepCategory::Fork, ExecutionMode::Children, &["c1", "c2", "c3"]),
        step("c1", "spy"),
        with_params(step("c2", "spy"), json!({ "fail_times": 1 })),
        with_params(step("c3", "spy"), json!({ "delay_ms": 30 })),
    ];

    let id = engine
        .submit_plan(graph("fork", nodes), PlanSeed::default())
        .await
        .unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Failed);

    let nodes = nodes_by_id(&engine, &id).await;
    assert_eq!(nodes["c3"].status, Status::Succeeded);
    assert_eq!(nodes["fork"].status, Status::Failed);
}

#[tokio::test]
async fn child_chain_stops_after_a_broken_child() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let nodes = vec![
        composite("group", StepCategory::StepGroup, ExecutionMode::ChildChain, &["a", "b", "c"]),
        step("a", "spy"),
        with_params(step("b", "spy"), json!({ "fail_times": 1 })),
        step("c", "spy"),
    ];

    let id = engine
        .submit_plan(graph("group", nodes), PlanSeed::default())
        .await
        .unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Failed);
    assert_eq!(spy.calls(), vec!["a", "b"]);
    assert!(!nodes_by_id(&engine, &id).await.contains_key("c"));
}

#[tokio::test]
async fn chain_children_link_to_the_child_before_them() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let ids: Vec<String> = (0..12).map(|i| format!("c{i}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let mut nodes = vec![composite("group", StepCategory::StepGroup, ExecutionMode::ChildChain, &refs)];
    nodes.extend(ids.iter().map(|id| step(id, "spy")));

    let id = engine
        .submit_plan(graph("group", nodes), PlanSeed::default())
        .await
        .unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);
    assert_eq!(spy.calls(), ids);

    let nodes = nodes_by_id(&engine, &id).await;
    assert!(nodes["c0"].previous_id.is_none());
    for pair in ids.windows(2) {
        assert_eq!(nodes[&pair[1]].previous_id, Some(nodes[&pair[0]].id), "{}", pair[1]);
    }
}

#[tokio::test]
async fn retry_strategy_reruns_until_success() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let flaky = with_strategy(
        with_params(step("n1", "spy"), json!({ "fail_times": 2 })),
        FailureStrategy::Retry {
            max_retries: 3,
            wait_ms: 0,
        },
    );

    let id = engine
        .submit_plan(linear(vec![flaky, step("n2", "spy")]), PlanSeed::default())
        .await
        .unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);
    assert_eq!(spy.count("n1"), 3);
    assert_eq!(spy.count("n2"), 1);

    let all = engine.backend().nodes().fetch_nodes_by_plan(&id).await.unwrap();
    let attempts: Vec<_> = all.iter().filter(|n| n.node_id == "n1").collect();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts.iter().filter(|n| n.old_retry).count(), 2);
    let live = nodes_by_id(&engine, &id).await;
    assert_eq!(live["n1"].retry_index, 2);
    assert_eq!(live["n1"].status, Status::Succeeded);
}

#[tokio::test]
async fn retried_stage_supersedes_the_children_of_the_failed_attempt() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let stage = with_strategy(
        with_next(
            composite("s1", StepCategory::Stage, ExecutionMode::Child, &["s1_step"]),
            "after",
        ),
        FailureStrategy::Retry {
            max_retries: 1,
            wait_ms: 0,
        },
    );
    let nodes = vec![
        stage,
        with_params(step("s1_step", "spy"), json!({ "fail_times": 1 })),
        step("after", "spy"),
    ];

    let id = engine
        .submit_plan(graph("s1", nodes), PlanSeed::default())
        .await
        .unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);
    assert_eq!(spy.count("s1_step"), 2);
    assert_eq!(spy.count("after"), 1);

    let all = engine.backend().nodes().fetch_nodes_by_plan(&id).await.unwrap();
    let first_attempt = all
        .iter()
        .find(|n| n.node_id == "s1" && n.retry_index == 0)
        .unwrap();
    assert!(first_attempt.old_retry);
    let failed_child = all
        .iter()
        .find(|n| n.parent_id == Some(first_attempt.id))
        .unwrap();
    assert_eq!(failed_child.status, Status::Failed);
    assert!(failed_child.old_retry);

    let live = nodes_by_id(&engine, &id).await;
    assert_eq!(live["s1"].status, Status::Succeeded);
    assert_eq!(live["s1_step"].status, Status::Succeeded);
    assert_eq!(live["s1_step"].parent_id, Some(live["s1"].id));
    assert_eq!(
        engine.plans().calculate_status(&id).await.unwrap(),
        Status::Succeeded
    );
}

#[tokio::test]
async fn retry_strategy_gives_up_after_max_retries() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let flaky = with_strategy(
        with_params(step("n1", "spy"), json!({ "fail_times": 10 })),
        FailureStrategy::Retry {
            max_retries: 1,
            wait_ms: 5,
        },
    );

    let id = engine
        .submit_plan(linear(vec![flaky]), PlanSeed::default())
        .await
        .unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Failed);
    assert_eq!(spy.count("n1"), 2);
}

#[tokio::test]
async fn ignore_and_mark_success_strategies_continue_the_chain() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let plan = linear(vec![
        with_strategy(step("n1", "fail"), FailureStrategy::Ignore),
        with_strategy(step("n2", "fail"), FailureStrategy::MarkSuccess),
        step("n3", "spy"),
    ]);

    let id = engine.submit_plan(plan, PlanSeed::default()).await.unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);

    let nodes = nodes_by_id(&engine, &id).await;
    assert_eq!(nodes["n1"].status, Status::IgnoreFailed);
    assert_eq!(nodes["n2"].status, Status::Succeeded);
    assert_eq!(nodes["n3"].status, Status::Succeeded);
    assert_eq!(spy.count("n3"), 1);
}

#[tokio::test]
async fn approval_blocks_the_plan_until_delivered() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let plan = linear(vec![
        with_params(step("gate", "wait"), json!({ "status": "approval_waiting" })),
        with_params(step("deploy", "spy"), json!({ "delay_ms": 200 })),
    ]);

    let id = engine.submit_plan(plan, PlanSeed::default()).await.unwrap();
    let (_, callback) = parked_node(&engine, &id, Status::ApprovalWaiting).await;
    plan_reaches(&engine, &id, Status::ApprovalWaiting).await;

    engine
        .deliver_step_result(&callback, StepResponse::succeeded(json!({ "approved_by": "ops" })))
        .await
        .unwrap();
    plan_reaches(&engine, &id, Status::Running).await;
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);
}

#[tokio::test]
async fn status_events_follow_the_plan() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let mut events = engine.subscribe();
    let plan = linear(vec![with_params(step("gate", "wait"), json!({ "status": "approval_waiting" }))]);

    let id = engine.submit_plan(plan, PlanSeed::default()).await.unwrap();
    let (_, callback) = parked_node(&engine, &id, Status::ApprovalWaiting).await;
    engine
        .deliver_step_result(&callback, StepResponse::succeeded(json!(null)))
        .await
        .unwrap();
    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.plan_execution_id, id);
        seen.push(event.status);
    }
    assert_eq!(seen.first(), Some(&Status::Running));
    assert!(seen.contains(&Status::ApprovalWaiting));
    assert_eq!(seen.last(), Some(&Status::Succeeded));
}

#[tokio::test]
async fn recover_reattaches_parked_nodes_after_restart() {
    let spy = SpyStep::new();
    let backend = Arc::new(MemoryBackend::new());
    let first = engine_over(backend.clone(), &spy);
    let plan = linear(vec![step("n1", "wait"), step("n2", "spy")]);

    let id = first.submit_plan(plan, PlanSeed::default()).await.unwrap();
    let (_, callback) = parked_node(&first, &id, Status::AsyncWaiting).await;
    drop(first);

    let second: Arc<Orchestrator<MemoryBackend>> = engine_over(backend, &spy);
    assert_eq!(second.recover().await.unwrap(), 1);
    let delivery = second
        .deliver_step_result(&callback, StepResponse::succeeded(json!(null)))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Resumed);
    assert_eq!(second.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);
    assert_eq!(spy.count("n2"), 1);
}

#[tokio::test]
async fn recovered_node_missing_from_its_graph_errors_the_plan() {
    let spy = SpyStep::new();
    let backend = Arc::new(MemoryBackend::new());
    let plan = linear(vec![step("n1", "wait"), step("n2", "spy")]);
    // The stored copy of the graph no longer knows n1.
    let stored = graph("m1", vec![step("m1", "spy")]);
    backend
        .save_graph(&PlanGraph {
            plan_id: plan.plan_id,
            ..stored
        })
        .await
        .unwrap();

    let first = engine_over(backend.clone(), &spy);
    let id = first.submit_plan(plan, PlanSeed::default()).await.unwrap();
    let (parked, _) = parked_node(&first, &id, Status::AsyncWaiting).await;
    first
        .nodes()
        .update_status(&parked.id, NodeTransition::to(Status::Running).forced())
        .await
        .unwrap();
    drop(first);

    let second = engine_over(backend, &spy);
    assert_eq!(second.recover().await.unwrap(), 1);
    plan_reaches(&second, &id, Status::Errored).await;
    let plan = second.plans().get(&id).await.unwrap();
    assert!(plan.end_ts.is_some());
    assert_eq!(spy.count("n2"), 0);
}

#[tokio::test]
async fn recover_reattaches_composite_parents() {
    let spy = SpyStep::new();
    let backend = Arc::new(MemoryBackend::new());
    let first = engine_over(backend.clone(), &spy);
    let plan = graph(
        "pipeline",
        vec![
            composite("pipeline", StepCategory::Pipeline, ExecutionMode::Child, &["group"]),
            composite("group", StepCategory::StepGroup, ExecutionMode::ChildChain, &["a", "b"]),
            step("a", "wait"),
            step("b", "spy"),
        ],
    );

    let id = first.submit_plan(plan, PlanSeed::default()).await.unwrap();
    let (_, callback) = parked_node(&first, &id, Status::AsyncWaiting).await;
    drop(first);

    let second = engine_over(backend, &spy);
    // One callback plus the two RUNNING composites.
    assert_eq!(second.recover().await.unwrap(), 3);
    second
        .deliver_step_result(&callback, StepResponse::succeeded(json!(null)))
        .await
        .unwrap();
    assert_eq!(second.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);
    assert_eq!(spy.count("b"), 1);

    let nodes = nodes_by_id(&second, &id).await;
    assert_eq!(nodes["group"].status, Status::Succeeded);
    assert_eq!(nodes["pipeline"].status, Status::Succeeded);
}

#[tokio::test]
async fn result_delivered_before_recover_is_picked_up() {
    let spy = SpyStep::new();
    let backend = Arc::new(MemoryBackend::new());
    let first = engine_over(backend.clone(), &spy);
    let id = first
        .submit_plan(linear(vec![step("n1", "wait")]), PlanSeed::default())
        .await
        .unwrap();
    let (_, callback) = parked_node(&first, &id, Status::AsyncWaiting).await;
    drop(first);

    let second = engine_over(backend, &spy);
    let delivery = second
        .deliver_step_result(&callback, StepResponse::failed("remote executor crashed"))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Parked);
    assert_eq!(second.recover().await.unwrap(), 1);
    assert_eq!(second.await_plan(&id, WAIT).await.unwrap(), Status::Failed);
}

#[tokio::test]
async fn concurrent_recomputes_settle_on_running() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let nodes = vec![
        composite("fork", StepCategory::Fork, ExecutionMode::Children, &["g1", "g2", "g3"]),
        with_params(step("g1", "wait"), json!({ "status": "approval_waiting" })),
        with_params(step("g2", "wait"), json!({ "status": "approval_waiting" })),
        with_params(step("g3", "wait"), json!({ "status": "approval_waiting" })),
    ];
    let id = engine
        .submit_plan(graph("fork", nodes), PlanSeed::default())
        .await
        .unwrap();

    let mut callbacks = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    while callbacks.len() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "gates never parked");
        callbacks = nodes_by_id(&engine, &id)
            .await
            .into_values()
            .filter(|n| n.status == Status::ApprovalWaiting)
            .filter_map(|n| {
                n.executable_responses.iter().find_map(|r| match r {
                    ExecutableResponse::Async { callback_ids } => {
                        callback_ids.first().cloned()
                    }
                    _ => None,
                })
            })
            .collect();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    plan_reaches(&engine, &id, Status::ApprovalWaiting).await;

    let deliveries = callbacks.iter().map(|cb| {
        let engine = Arc::clone(&engine);
        let cb = cb.clone();
        tokio::spawn(async move {
            engine
                .deliver_step_result(&cb, StepResponse::succeeded(json!(null)))
                .await
                .unwrap()
        })
    });
    for delivery in futures_util::future::join_all(deliveries).await {
        assert_eq!(delivery.unwrap(), Delivery::Resumed);
    }

    assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);
    let nodes = nodes_by_id(&engine, &id).await;
    assert!(nodes.values().all(|n| n.status == Status::Succeeded));
}
