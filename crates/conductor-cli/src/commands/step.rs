//! `conductor step ...`: step-level commands.

use conductor_core::models::{Workflow, WorkflowStatus};
use conductor_core::WorkflowController;

use super::follow::{follow, ClarifyMode};
use super::print_serialized;

/// Retry a failed step and follow the workflow from there.
pub async fn retry(
    controller: &WorkflowController,
    step_id: &str,
    mode: ClarifyMode,
) -> Result<Workflow, String> {
    let step = controller.get_step(step_id).await.map_err(|e| e.to_string())?;
    let workflow = controller
        .get_workflow(&step.workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    // A failed workflow gets a fresh event hub when it is reopened.
    let early = if workflow.status == WorkflowStatus::Failed {
        None
    } else {
        Some(
            controller
                .subscribe(&step.workflow_id)
                .await
                .map_err(|e| e.to_string())?,
        )
    };
    let step = controller
        .retry_step(step_id)
        .await
        .map_err(|e| e.to_string())?;
    let events = match early {
        Some(events) => events,
        None => controller
            .subscribe(&step.workflow_id)
            .await
            .map_err(|e| e.to_string())?,
    };
    println!(
        "🔄 Retrying step {} ({}), attempt {}",
        step.step_number,
        step.step_type.as_str(),
        step.retry_count + 1
    );
    follow(controller, &step.workflow_id, events, mode).await
}

pub async fn skip(controller: &WorkflowController, step_id: &str) -> Result<(), String> {
    let step = controller
        .skip_step(step_id)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "⏭  Step {} ({}) is {}",
        step.step_number,
        step.step_type.as_str(),
        step.status.as_str()
    );
    Ok(())
}

/// Replace a finished step's output. Exactly one of `text` or `file` is used.
pub async fn edit(
    controller: &WorkflowController,
    step_id: &str,
    text: Option<String>,
    file: Option<String>,
) -> Result<(), String> {
    let output = match (text, file) {
        (Some(text), None) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read '{}': {}", path, e))?,
        (Some(_), Some(_)) => return Err("Pass either --text or --file, not both".to_string()),
        (None, None) => return Err("Pass the new output with --text or --file".to_string()),
    };
    let step = controller
        .edit_step_output(step_id, output)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "✏️  Step {} output updated ({} chars, original kept)",
        step.step_number,
        step.output_text.as_deref().map(|t| t.chars().count()).unwrap_or(0)
    );
    Ok(())
}

/// Print the activity log recorded for a step.
pub async fn activity(controller: &WorkflowController, step_id: &str, json: bool) -> Result<(), String> {
    let entries = controller
        .list_activity(step_id)
        .await
        .map_err(|e| e.to_string())?;
    if json {
        return print_serialized(&entries);
    }
    if entries.is_empty() {
        println!("No activity recorded for step {}", step_id);
        return Ok(());
    }
    for entry in &entries {
        let tool = entry
            .tool_use_id
            .as_deref()
            .map(|id| format!(" [{}]", id))
            .unwrap_or_default();
        println!(
            "{}  {:<18}{}",
            entry.timestamp.format("%H:%M:%S%.3f"),
            entry.event_type,
            tool
        );
    }
    Ok(())
}
