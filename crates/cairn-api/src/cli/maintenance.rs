//! Housekeeping commands: sweep, purge and retain.

use anyhow::{Context, bail};
use chrono::{Duration, Utc};
use console::style;
use uuid::Uuid;

use crate::state::AppState;

pub async fn sweep(state: &AppState, json: bool) -> anyhow::Result<()> {
    let report = state.reconciler.sweep().await?;

    if json {
        let out = serde_json::json!({
            "scanned": report.scanned,
            "ended": report.ended,
            "recomputed": report.recomputed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Checked {} running execution(s)",
        style("✓").green().bold(),
        report.scanned
    );
    if report.ended > 0 {
        println!("    {} ended", style(report.ended).bold());
    }
    if report.recomputed > 0 {
        println!("    {} status recomputed", style(report.recomputed).bold());
    }
    println!();
    Ok(())
}

pub async fn purge(state: &AppState, json: bool) -> anyhow::Result<()> {
    let deleted = state.retention.purge_expired(Utc::now()).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "deleted": deleted }))?
        );
    } else {
        println!();
        println!(
            "  {} Deleted {} expired execution(s) (retention {} days)",
            style("✓").green().bold(),
            deleted,
            state.config.retention.ttl_days
        );
        println!();
    }
    Ok(())
}

pub async fn retain(state: &AppState, id: &str, days: u32, json: bool) -> anyhow::Result<()> {
    let id = Uuid::parse_str(id).with_context(|| format!("invalid plan execution id '{id}'"))?;
    let valid_until = Utc::now() + Duration::days(i64::from(days));
    if !state.engine.plans().update_ttl(&id, valid_until).await? {
        bail!("plan execution {id} not found");
    }

    if json {
        let out = serde_json::json!({ "plan_execution_id": id, "valid_until": valid_until });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {} retained until {}",
            style("✓").green().bold(),
            style(id).cyan(),
            valid_until.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
    }
    Ok(())
}
