//! `conductor run|list|show|resume|cancel|rerun|recover`: workflow lifecycle.

use conductor_core::models::{CreateWorkflowInput, Workflow};
use conductor_core::WorkflowController;

use super::follow::{follow, ClarifyMode};
use super::{
    parse_pause_behavior, parse_step_types, parse_workflow_status, parse_workflow_type,
    print_serialized,
};

/// Arguments for `conductor run`.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub feature_name: String,
    pub feature_request: String,
    pub workflow_type: String,
    pub pause_behavior: String,
    /// Comma-separated step types overriding the configured template.
    pub steps: Option<String>,
    pub mode: ClarifyMode,
}

/// Create a workflow, start it, and follow it until it pauses or ends.
pub async fn run(controller: &WorkflowController, args: RunArgs) -> Result<Workflow, String> {
    let step_types = match args.steps.as_deref() {
        Some(csv) => Some(parse_step_types(csv)?),
        None => None,
    };
    let workflow = controller
        .create(CreateWorkflowInput {
            feature_name: args.feature_name,
            feature_request: args.feature_request,
            workflow_type: parse_workflow_type(&args.workflow_type)?,
            pause_behavior: parse_pause_behavior(&args.pause_behavior)?,
            step_types,
            parent_workflow_id: None,
        })
        .await
        .map_err(|e| e.to_string())?;

    println!("📄 Workflow {} ({})", workflow.id, workflow.feature_name);
    println!(
        "   {} step(s): {}",
        workflow.total_steps,
        workflow
            .step_types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
    );
    println!("   backend: {}", controller.backend_name());

    start_and_follow(controller, &workflow.id, args.mode).await
}

/// Resume a paused workflow and follow it.
pub async fn resume(
    controller: &WorkflowController,
    workflow_id: &str,
    mode: ClarifyMode,
) -> Result<Workflow, String> {
    let events = controller
        .subscribe(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    let workflow = controller
        .resume(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    if workflow.status.is_terminal() {
        println!("Workflow {} is already {}", workflow.id, workflow.status.as_str());
        return Ok(workflow);
    }
    follow(controller, workflow_id, events, mode).await
}

/// Re-run a workflow as a new one linked to it, then follow the new run.
pub async fn rerun(
    controller: &WorkflowController,
    workflow_id: &str,
    mode: ClarifyMode,
) -> Result<Workflow, String> {
    let workflow = controller
        .rerun(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("🔁 Re-running {} as {}", workflow_id, workflow.id);
    start_and_follow(controller, &workflow.id, mode).await
}

async fn start_and_follow(
    controller: &WorkflowController,
    workflow_id: &str,
    mode: ClarifyMode,
) -> Result<Workflow, String> {
    let events = controller
        .subscribe(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    controller
        .start(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    follow(controller, workflow_id, events, mode).await
}

pub async fn cancel(controller: &WorkflowController, workflow_id: &str) -> Result<(), String> {
    let workflow = controller
        .cancel(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("Workflow {} is {}", workflow.id, workflow.status.as_str());
    Ok(())
}

/// List workflows, newest first.
pub async fn list(
    controller: &WorkflowController,
    status: Option<&str>,
    json: bool,
) -> Result<(), String> {
    let status = status.map(parse_workflow_status).transpose()?;
    let workflows = controller
        .list_workflows(status)
        .await
        .map_err(|e| e.to_string())?;
    if json {
        return print_serialized(&workflows);
    }
    if workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<24}  {:<14}  {:<10}  {}",
        "ID", "FEATURE", "TYPE", "STATUS", "STEP"
    );
    for wf in &workflows {
        println!(
            "{:<36}  {:<24}  {:<14}  {:<10}  {}/{}",
            wf.id,
            truncate(&wf.feature_name, 24),
            wf.workflow_type.as_str(),
            wf.status.as_str(),
            wf.current_step_number,
            wf.total_steps
        );
    }
    Ok(())
}

/// Show a workflow with its steps.
pub async fn show(controller: &WorkflowController, workflow_id: &str, json: bool) -> Result<(), String> {
    let workflow = controller
        .get_workflow(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    let steps = controller
        .list_steps(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    let pending = controller
        .pending_clarification(workflow_id)
        .await
        .map_err(|e| e.to_string())?;

    if json {
        return print_serialized(&serde_json::json!({
            "workflow": workflow,
            "steps": steps,
            "pendingClarification": pending,
        }));
    }

    println!("Workflow:  {}", workflow.id);
    println!("Feature:   {}", workflow.feature_name);
    println!("Type:      {}", workflow.workflow_type.as_str());
    println!("Policy:    {}", workflow.pause_behavior.as_str());
    println!("Status:    {}", workflow.status.as_str());
    if let Some(parent) = &workflow.parent_workflow_id {
        println!("Parent:    {}", parent);
    }
    if let Some(error) = &workflow.error_message {
        println!("Error:     {}", error);
    }
    println!();
    for (i, step_type) in workflow.step_types.iter().enumerate() {
        let number = i as u32 + 1;
        match steps.iter().find(|s| s.step_number == number) {
            Some(step) => {
                let mut line = format!(
                    "  {}. {:<14} {:<10}",
                    number,
                    step_type.as_str(),
                    step.status.as_str()
                );
                if step.retry_count > 0 {
                    line.push_str(&format!(" retries={}", step.retry_count));
                }
                if let Some(ms) = step.duration_ms {
                    line.push_str(&format!(" {}ms", ms));
                }
                if step.original_output_text.is_some() {
                    line.push_str(" (edited)");
                }
                println!("{}  [{}]", line, step.id);
                if let Some(error) = &step.error_message {
                    println!("     error: {}", error);
                }
            }
            None => println!("  {}. {:<14} -", number, step_type.as_str()),
        }
    }
    if let Some(pending) = pending {
        println!();
        println!(
            "Waiting on clarification {} ({} question(s))",
            pending.tool_use_id,
            pending.request.questions.len()
        );
    }
    Ok(())
}

/// Reconcile state left behind by a crashed process.
pub async fn recover(controller: &WorkflowController) -> Result<(), String> {
    let report = controller.recover().await.map_err(|e| e.to_string())?;
    println!(
        "Recovered: {} interrupted step(s) failed, {} workflow(s) paused",
        report.failed_steps.len(),
        report.paused_workflows.len()
    );
    for id in &report.failed_steps {
        println!("  step {} → failed (interrupted)", id);
    }
    for id in &report.paused_workflows {
        println!("  workflow {} → paused", id);
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}
