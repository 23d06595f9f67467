//! Foreground observer: streams a workflow's events to the terminal and
//! answers clarification questions until the workflow goes idle.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use console::style;
use conductor_core::clarification::{ClarificationRequest, ClarificationResponse};
use conductor_core::models::{StepStatus, Workflow, WorkflowStatus};
use conductor_core::stream::{AgentPhase, StreamEvent, Subscription};
use conductor_core::{WorkflowController, WorkflowEvent};
use dialoguer::{Confirm, Input, MultiSelect, Select};
use serde_json::{json, Value};

/// How clarification questions are handled while following.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClarifyMode {
    /// Prompt on the terminal.
    Interactive,
    /// Answer every clarification with a skip.
    Skip,
}

/// Follow `workflow_id` until no step is running. `events` must be
/// subscribed before the workflow was started or resumed.
pub async fn follow(
    controller: &WorkflowController,
    workflow_id: &str,
    mut events: Subscription<WorkflowEvent>,
    mode: ClarifyMode,
) -> Result<Workflow, String> {
    let idle = controller.wait_until_idle(workflow_id);
    tokio::pin!(idle);
    let mut streaming = true;

    loop {
        tokio::select! {
            done = &mut idle => {
                let workflow = done.map_err(|e| e.to_string())?;
                // Flush whatever is already queued without waiting for more.
                while let Ok(Some(event)) = tokio::time::timeout(Duration::ZERO, events.recv()).await {
                    render(&event);
                }
                print_outcome(&workflow);
                return Ok(workflow);
            }
            event = events.recv(), if streaming => match event {
                Some(WorkflowEvent::StepStatus { status: StepStatus::Paused, .. }) => {
                    println!("\n{}", style("⏸  Waiting for clarification").yellow().bold());
                    answer_pending(controller, workflow_id, mode).await?;
                }
                Some(event) => render(&event),
                None => streaming = false,
            },
        }
    }
}

async fn answer_pending(
    controller: &WorkflowController,
    workflow_id: &str,
    mode: ClarifyMode,
) -> Result<(), String> {
    let Some(pending) = controller
        .pending_clarification(workflow_id)
        .await
        .map_err(|e| e.to_string())?
    else {
        return Ok(());
    };

    let response = match mode {
        ClarifyMode::Skip => {
            println!("   skipping {} question(s)", pending.request.questions.len());
            ClarificationResponse::Skipped
        }
        ClarifyMode::Interactive => {
            let request = pending.request.clone();
            tokio::task::spawn_blocking(move || ask(&request))
                .await
                .map_err(|e| format!("Prompt task failed: {}", e))??
        }
    };
    controller
        .answer_clarification(workflow_id, response)
        .await
        .map_err(|e| e.to_string())
}

/// Ask every question on the terminal. Answers are keyed by question header.
pub fn ask(request: &ClarificationRequest) -> Result<ClarificationResponse, String> {
    if let Some(assessment) = &request.assessment {
        println!("{}", style(assessment).dim());
    }
    let answer = Confirm::new()
        .with_prompt(format!("Answer {} question(s)? (no skips them)", request.questions.len()))
        .default(true)
        .interact()
        .map_err(|e| e.to_string())?;
    if !answer {
        return Ok(ClarificationResponse::Skipped);
    }

    let mut answers = BTreeMap::new();
    for question in &request.questions {
        let key = if question.header.is_empty() {
            question.question.clone()
        } else {
            question.header.clone()
        };
        let labels: Vec<&str> = question.options.iter().map(|o| o.label.as_str()).collect();
        let value = if labels.is_empty() {
            let text: String = Input::new()
                .with_prompt(&question.question)
                .interact_text()
                .map_err(|e| e.to_string())?;
            Value::String(text)
        } else if question.multi_select {
            let picked = MultiSelect::new()
                .with_prompt(&question.question)
                .items(&labels)
                .interact()
                .map_err(|e| e.to_string())?;
            json!(picked.iter().map(|&i| labels[i]).collect::<Vec<_>>())
        } else {
            let picked = Select::new()
                .with_prompt(&question.question)
                .items(&labels)
                .default(0)
                .interact()
                .map_err(|e| e.to_string())?;
            json!(labels[picked])
        };
        answers.insert(key, value);
    }
    Ok(ClarificationResponse::Answers(answers))
}

fn render(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::Agent { event, .. } => render_agent_event(event),
        WorkflowEvent::StepStatus {
            step_number,
            status,
            ..
        } => {
            let label = format!("Step {} {}", step_number, status.as_str());
            let styled = match status {
                StepStatus::Running => style(label).cyan().bold(),
                StepStatus::Completed => style(label).green(),
                StepStatus::Failed => style(label).red().bold(),
                StepStatus::Skipped => style(label).yellow(),
                _ => style(label).dim(),
            };
            println!("\n{}", styled);
        }
        WorkflowEvent::WorkflowStatus { status } => {
            println!("{}", style(format!("Workflow {}", status.as_str())).bold());
        }
    }
}

fn render_agent_event(event: &StreamEvent) {
    match event {
        StreamEvent::TextDelta { text } => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        StreamEvent::ThinkingStart => println!("{}", style("💭 thinking...").dim()),
        StreamEvent::ToolStart { tool_name, .. } => {
            println!("\n{} {}", style("→").cyan(), style(tool_name).cyan());
        }
        StreamEvent::ToolStop { is_error: true, .. } => {
            println!("{}", style("  tool failed").red());
        }
        StreamEvent::Usage { usage } => {
            println!(
                "\n{}",
                style(format!(
                    "   tokens: {} in / {} out, ${:.4}",
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.estimated_cost_usd()
                ))
                .dim()
            );
        }
        StreamEvent::PhaseChange {
            phase: AgentPhase::Failed { error_message },
        } => println!("\n{} {}", style("✗").red(), error_message),
        _ => {}
    }
}

fn print_outcome(workflow: &Workflow) {
    println!();
    match workflow.status {
        WorkflowStatus::Completed => println!(
            "{}",
            style(format!("🎉 Workflow {} completed", workflow.id)).green().bold()
        ),
        WorkflowStatus::Paused => println!(
            "⏸  Workflow {} paused after step {}/{}. Resume with: conductor resume {}",
            workflow.id, workflow.current_step_number, workflow.total_steps, workflow.id
        ),
        WorkflowStatus::Failed => println!(
            "{} {}",
            style("✗ Workflow failed:").red().bold(),
            workflow.error_message.as_deref().unwrap_or("unknown error")
        ),
        status => println!("Workflow {} is {}", workflow.id, status.as_str()),
    }
}
