//! Styled terminal output shared by the command handlers.

use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;

use cairn_types::node::NodeExecution;
use cairn_types::plan::{PlanExecution, PlanExecutionMetadata};
use cairn_types::status::Status;

/// Colored status cell for tables.
pub fn status_cell(status: Status) -> Cell {
    let color = match status {
        Status::Succeeded => Color::Green,
        Status::IgnoreFailed | Status::Skipped => Color::DarkGreen,
        Status::Failed | Status::Errored => Color::Red,
        Status::Aborted | Status::Expired | Status::Discontinuing => Color::DarkGrey,
        Status::Running | Status::Queued => Color::Cyan,
        _ => Color::Yellow,
    };
    Cell::new(format!("● {status}")).fg(color)
}

/// Status styled for inline text.
pub fn styled_status(status: Status) -> String {
    let label = status.to_string();
    let styled = match status {
        Status::Succeeded | Status::IgnoreFailed | Status::Skipped => style(label).green(),
        Status::Failed | Status::Errored => style(label).red(),
        Status::Running | Status::Queued => style(label).cyan(),
        Status::Aborted | Status::Expired | Status::Discontinuing => style(label).dim(),
        _ => style(label).yellow(),
    };
    styled.bold().to_string()
}

/// The snake_case wire name of a serde enum.
pub fn wire_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default()
}

fn timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn print_plan(plan: &PlanExecution, metadata: Option<&PlanExecutionMetadata>) {
    println!();
    println!(
        "  {} {}",
        style("Plan execution").bold(),
        style(plan.id).cyan()
    );
    println!();
    let row = |label: &str, value: String| {
        println!("  {:<14} {}", style(label).dim(), value);
    };
    row("Status", styled_status(plan.status));
    row("Plan", plan.plan_id.to_string());
    if !plan.metadata.pipeline_identifier.is_empty() {
        row("Pipeline", plan.metadata.pipeline_identifier.clone());
    }
    if let Some(tag) = &plan.metadata.execution_tag {
        row("Tag", tag.clone());
    }
    for (key, value) in &plan.setup_abstractions {
        row(key, value.clone());
    }
    row("Started", timestamp(Some(plan.start_ts)));
    row("Ended", timestamp(plan.end_ts));
    row("Retained until", timestamp(plan.valid_until));

    if let Some(retry) = &plan.metadata.retry_info {
        row("Resumed from", retry.parent_plan_execution_id.to_string());
        row("Root", retry.root_plan_execution_id.to_string());
    }
    if let Some(metadata) = metadata {
        if let Some(stages) = &metadata.retry_stages_metadata {
            if !stages.retry_stage_identifiers.is_empty() {
                row("Re-run stages", stages.retry_stage_identifiers.join(", "));
            }
            if !stages.identity_stage_identifiers.is_empty() {
                row("Replayed", stages.identity_stage_identifiers.join(", "));
            }
        }
        if let Some(notes) = &metadata.notes {
            row("Notes", notes.clone());
        }
    }
    println!();
}

pub fn nodes_table(nodes: &[NodeExecution]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::White),
            Cell::new("Status").fg(Color::White),
            Cell::new("Category").fg(Color::White),
            Cell::new("Mode").fg(Color::White),
            Cell::new("Type").fg(Color::White),
            Cell::new("Attempt").fg(Color::White),
            Cell::new("Ended").fg(Color::White),
            Cell::new("Detail").fg(Color::White),
        ]);

    for node in nodes {
        let name = if node.old_retry {
            format!("{} (superseded)", node.node_id)
        } else {
            node.node_id.clone()
        };
        let detail = node
            .failure_info
            .as_ref()
            .map(|f| f.message.clone())
            .or_else(|| node.outputs.as_ref().map(|o| o.to_string()))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(name),
            status_cell(node.status),
            Cell::new(wire_name(&node.step_category)),
            Cell::new(wire_name(&node.mode)),
            Cell::new(wire_name(&node.node_type)),
            Cell::new(node.retry_index + 1),
            Cell::new(timestamp(node.end_ts)),
            Cell::new(detail),
        ]);
    }
    table
}

/// Line printed after a command stopped driving a plan.
pub fn print_outcome(id: &uuid::Uuid, status: Status) {
    let hint = if status.is_final() {
        String::new()
    } else {
        format!("  {}", style("(parked, see `cairn nodes`)").dim())
    };
    println!(
        "  {} {} {}{}",
        style("→").dim(),
        style(id).cyan(),
        styled_status(status),
        hint
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::graph::{ExecutionMode, StepCategory};

    #[test]
    fn test_wire_name_uses_serde_names() {
        assert_eq!(wire_name(&StepCategory::StepGroup), "step_group");
        assert_eq!(wire_name(&ExecutionMode::ChildChain), "child_chain");
    }

    #[test]
    fn test_status_cell_shows_name() {
        let cell = status_cell(Status::ApprovalWaiting);
        assert_eq!(cell.content(), "● approval_waiting");
    }
}
