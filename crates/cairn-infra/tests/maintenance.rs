mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use cairn_core::event::StatusEventBus;
use cairn_core::execution::{Orchestrator, PlanSeed};
use cairn_core::notify::{Delivery, plan_callback_id};
use cairn_core::repository::metadata::PlanMetadataRepository;
use cairn_core::repository::node_execution::NodeExecutionRepository;
use cairn_core::repository::plan_execution::PlanExecutionRepository;
use cairn_core::repository::wait::WaitRepository;
use cairn_core::retry::RetryPolicy;
use cairn_core::service::node_execution::NodeTransition;
use cairn_core::service::reconcile::{Reconciler, SweepReport};
use cairn_core::service::retention::{MetadataCleanupObserver, RetentionService};
use cairn_infra::MemoryBackend;
use cairn_types::node::{NodeExecutionUpdate, StepResponse};
use cairn_types::notify::WaitState;
use cairn_types::status::Status;

use common::*;

#[tokio::test]
async fn purge_removes_expired_plans_in_batches() {
    let spy = SpyStep::new();
    let backend = Arc::new(MemoryBackend::new());
    let bus = StatusEventBus::builder(64)
        .with_delete_observer(Arc::new(MetadataCleanupObserver::new(
            backend.clone(),
            RetryPolicy::none(),
        )))
        .build();
    let engine = Orchestrator::builder(backend.clone(), test_config())
        .steps(registry_with(&spy))
        .bus(bus.clone())
        .build();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = engine
            .submit_plan(linear(vec![step("n1", "spy")]), PlanSeed::default())
            .await
            .unwrap();
        assert_eq!(engine.await_plan(&id, WAIT).await.unwrap(), Status::Succeeded);
        ids.push(id);
    }

    let retention = RetentionService::new(backend.clone(), bus, RetryPolicy::none(), 2);
    assert_eq!(retention.purge_expired(Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + Duration::days(365);
    assert_eq!(retention.purge_expired(later).await.unwrap(), 3);
    for id in &ids {
        assert!(backend.get_plan(id).await.unwrap().is_none());
        assert!(backend.fetch_nodes_by_plan(id).await.unwrap().is_empty());
        assert!(backend.get_metadata(id).await.unwrap().is_none());
    }
    assert_eq!(retention.purge_expired(later).await.unwrap(), 0);
}

#[tokio::test]
async fn purge_drops_consumed_wait_records() {
    let spy = SpyStep::new();
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(backend.clone(), &spy);

    let id = engine
        .submit_plan(linear(vec![step("n1", "wait")]), PlanSeed::default())
        .await
        .unwrap();
    let (_, callback) = parked_node(&engine, &id, Status::AsyncWaiting).await;
    engine
        .deliver_step_result(&callback, StepResponse::succeeded(json!(null)))
        .await
        .unwrap();
    engine.await_plan(&id, WAIT).await.unwrap();
    assert!(backend.get_wait(&callback).await.unwrap().is_some());

    let retention = RetentionService::new(
        backend.clone(),
        StatusEventBus::new(16),
        RetryPolicy::none(),
        100,
    );
    retention
        .purge_expired(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert!(backend.get_wait(&callback).await.unwrap().is_none());
}

#[tokio::test]
async fn purge_drops_unclaimed_wait_records_of_expired_plans() {
    let spy = SpyStep::new();
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(backend.clone(), &spy);

    // Nobody awaits this plan, so its final status stays parked.
    let finished = engine
        .submit_plan(linear(vec![step("n1", "spy")]), PlanSeed::default())
        .await
        .unwrap();
    plan_reaches(&engine, &finished, Status::Succeeded).await;
    let plan_callback = plan_callback_id(&finished);
    assert_eq!(
        backend.get_wait(&plan_callback).await.unwrap().unwrap().state,
        WaitState::Delivered
    );

    // A step result that arrives after the abort is stored but never claimed.
    let aborted = engine
        .submit_plan(linear(vec![step("n1", "wait")]), PlanSeed::default())
        .await
        .unwrap();
    let (_, step_callback) = parked_node(&engine, &aborted, Status::AsyncWaiting).await;
    engine.abort(&aborted).await.unwrap();
    assert_eq!(
        engine
            .deliver_step_result(&step_callback, StepResponse::succeeded(json!(null)))
            .await
            .unwrap(),
        Delivery::Parked
    );
    assert_eq!(
        backend.get_wait(&step_callback).await.unwrap().unwrap().state,
        WaitState::Delivered
    );

    let retention = RetentionService::new(
        backend.clone(),
        StatusEventBus::new(16),
        RetryPolicy::none(),
        100,
    );
    let later = Utc::now() + Duration::days(365);
    assert_eq!(retention.purge_expired(later).await.unwrap(), 2);
    assert!(backend.get_wait(&plan_callback).await.unwrap().is_none());
    assert!(backend.get_wait(&step_callback).await.unwrap().is_none());
    assert!(backend.get_wait(&plan_callback_id(&aborted)).await.unwrap().is_none());
}

#[tokio::test]
async fn retained_plan_outlives_its_original_deadline() {
    let spy = SpyStep::new();
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(backend.clone(), &spy);

    let kept = engine
        .submit_plan(linear(vec![step("n1", "spy")]), PlanSeed::default())
        .await
        .unwrap();
    let dropped = engine
        .submit_plan(linear(vec![step("n1", "spy")]), PlanSeed::default())
        .await
        .unwrap();
    assert_eq!(engine.await_plan(&kept, WAIT).await.unwrap(), Status::Succeeded);
    assert_eq!(engine.await_plan(&dropped, WAIT).await.unwrap(), Status::Succeeded);

    let valid_until = Utc::now() + Duration::days(3650);
    assert!(engine.plans().update_ttl(&kept, valid_until).await.unwrap());
    assert!(!engine.plans().update_ttl(&uuid::Uuid::now_v7(), valid_until).await.unwrap());

    let retention = RetentionService::new(
        backend.clone(),
        StatusEventBus::new(16),
        RetryPolicy::none(),
        100,
    );
    assert_eq!(retention.purge_expired(Utc::now() + Duration::days(365)).await.unwrap(), 1);
    assert!(backend.get_plan(&kept).await.unwrap().is_some());
    assert!(backend.get_plan(&dropped).await.unwrap().is_none());

    assert_eq!(retention.purge_expired(valid_until + Duration::days(1)).await.unwrap(), 1);
    assert!(backend.get_plan(&kept).await.unwrap().is_none());
}

#[tokio::test]
async fn purge_evicts_in_process_state_of_aborted_plans() {
    let spy = SpyStep::new();
    let backend = Arc::new(MemoryBackend::new());
    let builder = Orchestrator::builder(backend.clone(), test_config()).steps(registry_with(&spy));
    let evictor = builder.cache_evictor();
    let bus = StatusEventBus::builder(16)
        .with_delete_observer(Arc::new(evictor.clone()))
        .build();
    let engine = builder.bus(bus.clone()).build();

    let id = engine
        .submit_plan(linear(vec![step("n1", "wait")]), PlanSeed::default())
        .await
        .unwrap();
    parked_node(&engine, &id, Status::AsyncWaiting).await;
    assert_eq!(engine.abort(&id).await.unwrap(), Status::Aborted);
    // The cancelled token outlives the abort.
    assert_eq!(evictor.tracked(), 1);

    let retention = RetentionService::new(backend.clone(), bus, RetryPolicy::none(), 100);
    assert_eq!(retention.purge_expired(Utc::now() + Duration::days(365)).await.unwrap(), 1);
    assert_eq!(evictor.tracked(), 0);
}

#[tokio::test]
async fn sweep_ends_a_plan_whose_nodes_all_finished() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let id = engine
        .submit_plan(linear(vec![step("n1", "wait")]), PlanSeed::default())
        .await
        .unwrap();
    let (parked, _) = parked_node(&engine, &id, Status::AsyncWaiting).await;

    // The node finished but nothing advanced the plan.
    engine
        .nodes()
        .update_status(
            &parked.id,
            NodeTransition::to(Status::Succeeded)
                .with_update(NodeExecutionUpdate::ended(Utc::now()))
                .forced(),
        )
        .await
        .unwrap();
    assert_eq!(engine.get_status(&id).await.unwrap(), Status::Running);

    let reconciler = Reconciler::new(engine.backend().clone(), engine.plans().clone());
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            scanned: 1,
            ended: 1,
            recomputed: 0
        }
    );
    assert_eq!(engine.get_status(&id).await.unwrap(), Status::Succeeded);
    assert!(engine.plans().get(&id).await.unwrap().end_ts.is_some());

    // Nothing left to repair.
    assert_eq!(reconciler.sweep().await.unwrap(), SweepReport::default());
}

#[tokio::test]
async fn sweep_lifts_a_stale_blocking_status() {
    let spy = SpyStep::new();
    let engine = memory_engine(&spy);
    let id = engine
        .submit_plan(
            linear(vec![with_params(
                step("gate", "wait"),
                json!({ "status": "approval_waiting" }),
            )]),
            PlanSeed::default(),
        )
        .await
        .unwrap();
    let (parked, _) = parked_node(&engine, &id, Status::ApprovalWaiting).await;
    plan_reaches(&engine, &id, Status::ApprovalWaiting).await;

    // The gate moved on but the plan kept its blocking status.
    engine
        .nodes()
        .update_status(&parked.id, NodeTransition::to(Status::Running).forced())
        .await
        .unwrap();

    let reconciler = Reconciler::new(engine.backend().clone(), engine.plans().clone());
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.recomputed, 1);
    assert_eq!(engine.get_status(&id).await.unwrap(), Status::Running);
    engine.abort(&id).await.unwrap();
}

#[tokio::test]
async fn expired_plans_are_listed_oldest_first() {
    let backend = MemoryBackend::new();
    let spy = SpyStep::new();
    let engine = engine_over(Arc::new(MemoryBackend::new()), &spy);
    let id = engine
        .submit_plan(linear(vec![step("n1", "noop")]), PlanSeed::default())
        .await
        .unwrap();
    engine.await_plan(&id, WAIT).await.unwrap();

    let mut first = engine.plans().get(&id).await.unwrap();
    let mut second = first.clone();
    first.id = uuid::Uuid::now_v7();
    first.valid_until = Some(Utc::now() - Duration::hours(2));
    second.id = uuid::Uuid::now_v7();
    second.valid_until = Some(Utc::now() - Duration::hours(1));
    backend.save_plan(&second).await.unwrap();
    backend.save_plan(&first).await.unwrap();

    let expired = backend.find_expired_plans(Utc::now(), 10).await.unwrap();
    assert_eq!(expired, vec![first.id, second.id]);
    assert_eq!(
        backend.find_expired_plans(Utc::now(), 1).await.unwrap(),
        vec![first.id]
    );
}
