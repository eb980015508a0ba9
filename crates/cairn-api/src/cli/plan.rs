//! Plan execution commands: submit, resume, abort, status, nodes, deliver, recover.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use console::style;
use futures_util::StreamExt;
use futures_util::future::join_all;
use uuid::Uuid;

use cairn_core::execution::PlanSeed;
use cairn_core::notify::engine::Delivery;
use cairn_core::repository::Backend;
use cairn_core::repository::metadata::PlanMetadataRepository;
use cairn_core::repository::node_execution::NodeExecutionRepository;
use cairn_core::repository::plan_execution::PlanExecutionRepository;
use cairn_types::ambiance::keys;
use cairn_types::graph::PlanGraph;
use cairn_types::node::{ExecutableResponse, FailureInfo, NodeExecutionField, StepResponse};
use cairn_types::status::Status;

use crate::cli::render;
use crate::state::{AppState, Engine};

const SETTLE_POLL: Duration = Duration::from_millis(200);

fn parse_id(id: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("invalid plan execution id '{id}'"))
}

/// Drive `id` until it is final or every open node is parked on a callback.
///
/// Returns the plan status at that point. Gives up quietly at `timeout`.
pub async fn settle(engine: &Engine, id: &Uuid, timeout: Duration) -> anyhow::Result<Status> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut quiet_polls = 0;
    loop {
        let status = engine.get_status(id).await?;
        if status.is_final() {
            return Ok(status);
        }

        let open = engine
            .nodes()
            .with_status(id, Status::FINAL.complement())
            .await?;
        let busy = open.iter().any(|n| match n.status {
            Status::Queued | Status::Discontinuing => true,
            Status::Running => !n.mode.is_composite(),
            _ => false,
        });
        quiet_polls = if busy || open.is_empty() { 0 } else { quiet_polls + 1 };
        if quiet_polls >= 2 {
            return Ok(status);
        }

        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(plan_execution_id = %id, status = %status, "stopped driving before the plan settled");
            return Ok(status);
        }
        tokio::time::sleep(SETTLE_POLL).await;
    }
}

async fn report(
    state: &AppState,
    id: &Uuid,
    wait: u64,
    json: bool,
) -> anyhow::Result<()> {
    let status = settle(&state.engine, id, Duration::from_secs(wait)).await?;
    if json {
        let out = serde_json::json!({ "plan_execution_id": id, "status": status });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        render::print_outcome(id, status);
    }
    Ok(())
}

pub async fn submit_plan(
    state: &AppState,
    graph_path: &Path,
    tag: Option<String>,
    account: Option<String>,
    notes: Option<String>,
    wait: u64,
    json: bool,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(graph_path)
        .await
        .with_context(|| format!("failed to read {}", graph_path.display()))?;
    let graph: PlanGraph = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid plan graph", graph_path.display()))?;

    let mut seed = PlanSeed {
        notes,
        ..Default::default()
    };
    seed.metadata.execution_tag = tag;
    if let Some(account) = account {
        seed.setup_abstractions
            .insert(keys::ACCOUNT_ID.to_string(), account);
    }

    let id = state.engine.submit_plan(graph, seed).await?;
    if !json {
        println!();
        println!(
            "  {} Submitted {}",
            style("✓").green().bold(),
            style(id).cyan()
        );
    }
    report(state, &id, wait, json).await
}

pub async fn resume_plan(
    state: &AppState,
    id: &str,
    stages: Vec<String>,
    wait: u64,
    json: bool,
) -> anyhow::Result<()> {
    let original = parse_id(id)?;
    let stages: BTreeSet<String> = stages.into_iter().collect();
    let resumed = state.engine.resume_plan(&original, &stages).await?;
    if !json {
        println!();
        println!(
            "  {} Resumed {} as {}",
            style("✓").green().bold(),
            style(original).dim(),
            style(resumed).cyan()
        );
    }
    report(state, &resumed, wait, json).await
}

pub async fn abort_plan(state: &AppState, id: &str, json: bool) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let status = state.engine.abort(&id).await?;
    if json {
        let out = serde_json::json!({ "plan_execution_id": id, "status": status });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        render::print_outcome(&id, status);
    }
    Ok(())
}

pub async fn show_plan(state: &AppState, id: &str, json: bool) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let backend = state.engine.backend();
    let Some(plan) = backend.plans().get_plan(&id).await? else {
        bail!("plan execution {id} not found");
    };
    let metadata = backend.metadata().get_metadata(&id).await?;

    if json {
        let out = serde_json::json!({ "plan": plan, "metadata": metadata });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        render::print_plan(&plan, metadata.as_ref());
    }
    Ok(())
}

pub async fn list_nodes(state: &AppState, id: &str, all: bool, json: bool) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let mut nodes = state
        .engine
        .backend()
        .nodes()
        .fetch_nodes_by_plan(&id)
        .await?;
    if nodes.is_empty() && state.engine.backend().plans().get_plan(&id).await?.is_none() {
        bail!("plan execution {id} not found");
    }
    nodes.retain(|n| all || !n.old_retry);
    nodes.sort_by_key(|n| n.created_at);

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }
    println!("{}", render::nodes_table(&nodes));

    let callbacks: Vec<&str> = nodes
        .iter()
        .filter(|n| n.status == Status::AsyncWaiting || n.status.is_blocking())
        .filter_map(|n| {
            n.executable_responses.iter().rev().find_map(|r| match r {
                ExecutableResponse::Async { callback_ids } => callback_ids.first().map(String::as_str),
                _ => None,
            })
        })
        .collect();
    for callback in callbacks {
        println!("  {} {}", style("callback").dim(), style(callback).yellow());
    }
    Ok(())
}

/// Plan execution whose parked node waits on `correlation_id`.
async fn plan_waiting_on(state: &AppState, correlation_id: &str) -> anyhow::Result<Option<Uuid>> {
    let fields = [NodeExecutionField::ExecutableResponses];
    let parked = Status::BLOCKING.with(Status::AsyncWaiting);
    let mut stream = state.engine.backend().nodes().find_nodes_by_status(parked, &fields);
    while let Some(node) = stream.next().await {
        let node = node?;
        let waits_here = node.executable_responses.iter().flatten().any(|r| {
            matches!(r, ExecutableResponse::Async { callback_ids }
                if callback_ids.iter().any(|c| c == correlation_id))
        });
        if waits_here {
            return Ok(Some(node.plan_execution_id));
        }
    }
    Ok(None)
}

pub async fn deliver(
    state: &AppState,
    correlation_id: &str,
    status: &str,
    outputs: Option<String>,
    message: Option<String>,
    wait: u64,
    json: bool,
) -> anyhow::Result<()> {
    let status: Status = status.parse()?;
    let outputs = outputs
        .map(|raw| serde_json::from_str(&raw).context("--outputs is not valid JSON"))
        .transpose()?;
    let response = StepResponse {
        status,
        outputs,
        failure_info: message.map(FailureInfo::new),
    };

    // The process that parked the node is gone; re-attach its waiters first.
    state.engine.recover().await?;
    let plan = plan_waiting_on(state, correlation_id).await?;
    let delivery = state
        .engine
        .deliver_step_result(correlation_id, response)
        .await?;
    tracing::info!(correlation_id, ?delivery, "step result delivered");

    if !json {
        println!();
        let line = match delivery {
            Delivery::Resumed => format!("{} Resumed the waiting step", style("✓").green().bold()),
            Delivery::Parked => format!(
                "{} No step is waiting on this callback yet, result stored",
                style("!").yellow().bold()
            ),
            Delivery::Duplicate => format!(
                "{} A result was already delivered, ignored",
                style("!").yellow().bold()
            ),
        };
        println!("  {line}");
    }

    match plan {
        Some(id) if delivery == Delivery::Resumed => report(state, &id, wait, json).await,
        _ => {
            if json {
                let out = serde_json::json!({
                    "correlation_id": correlation_id,
                    "delivery": format!("{delivery:?}").to_lowercase(),
                    "plan_execution_id": plan,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            Ok(())
        }
    }
}

pub async fn recover(state: &AppState, wait: u64, json: bool) -> anyhow::Result<()> {
    let recovered = state.engine.recover().await?;

    let mut active = Vec::new();
    {
        let mut stream = state
            .engine
            .backend()
            .plans()
            .find_plans_by_status(Status::FINAL.complement(), &[]);
        while let Some(plan) = stream.next().await {
            active.push(plan?.id);
        }
    }

    let timeout = Duration::from_secs(wait);
    let settled = join_all(active.iter().map(|id| settle(&state.engine, id, timeout))).await;

    if json {
        let plans: Vec<_> = active
            .iter()
            .zip(&settled)
            .map(|(id, status)| {
                serde_json::json!({
                    "plan_execution_id": id,
                    "status": status.as_ref().ok(),
                })
            })
            .collect();
        let out = serde_json::json!({ "recovered": recovered, "plans": plans });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Picked up {} callback(s) and node(s)",
        style("✓").green().bold(),
        recovered
    );
    for (id, status) in active.iter().zip(settled) {
        render::print_outcome(id, status?);
    }
    Ok(())
}
