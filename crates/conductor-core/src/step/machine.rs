//! Step State Machine.
//!
//! Every step mutation goes through one of these functions. Each checks the
//! edge against [`StepStatus::can_transition_to`] first and returns
//! `InvalidTransition` instead of coercing.

use chrono::Utc;

use crate::error::EngineError;
use crate::models::{Step, StepStatus, StepType};
use crate::stream::{AgentPhase, StreamEvent, TokenUsage};

/// Result of feeding one stream event to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEffect {
    /// Nothing persisted changed.
    Unchanged,
    /// The step record changed and should be saved.
    Updated,
    /// The run ended; the caller decides what the terminal state means.
    Terminal,
}

fn ensure(step: &Step, next: StepStatus) -> Result<(), EngineError> {
    if step.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(EngineError::invalid_step_transition(
            step.status.as_str(),
            next.as_str(),
        ))
    }
}

fn set_status(step: &mut Step, next: StepStatus) {
    step.status = next;
    step.updated_at = Utc::now();
}

/// `pending -> running`.
pub fn start(step: &mut Step, input_text: Option<String>) -> Result<(), EngineError> {
    ensure(step, StepStatus::Running)?;
    if input_text.is_some() {
        step.input_text = input_text;
    }
    step.started_at = Some(Utc::now());
    set_status(step, StepStatus::Running);
    Ok(())
}

/// `running -> completed`.
pub fn complete(
    step: &mut Step,
    output_text: String,
    output_structured: Option<serde_json::Value>,
) -> Result<(), EngineError> {
    ensure(step, StepStatus::Completed)?;
    if step.status == StepStatus::Editing {
        return Err(EngineError::invalid_step_transition("editing", "completed (agent)"));
    }
    let now = Utc::now();
    step.output_text = Some(output_text);
    step.output_structured = output_structured;
    step.duration_ms = step
        .started_at
        .map(|s| (now - s).num_milliseconds().max(0) as u64);
    step.completed_at = Some(now);
    set_status(step, StepStatus::Completed);
    Ok(())
}

/// `running|paused -> failed`. `retry_count` is left alone.
pub fn fail(step: &mut Step, error_message: impl Into<String>) -> Result<(), EngineError> {
    ensure(step, StepStatus::Failed)?;
    let now = Utc::now();
    step.error_message = Some(error_message.into());
    step.duration_ms = step
        .started_at
        .map(|s| (now - s).num_milliseconds().max(0) as u64);
    step.completed_at = Some(now);
    set_status(step, StepStatus::Failed);
    Ok(())
}

/// `running -> paused`, only while a clarification step waits on a person.
pub fn pause_for_clarification(step: &mut Step) -> Result<(), EngineError> {
    if step.step_type != StepType::Clarification {
        return Err(EngineError::invalid_step_transition(
            step.status.as_str(),
            format!("paused ({} steps never pause)", step.step_type.as_str()),
        ));
    }
    ensure(step, StepStatus::Paused)?;
    set_status(step, StepStatus::Paused);
    Ok(())
}

/// `paused -> running`, once the clarification is resolved.
pub fn resume(step: &mut Step) -> Result<(), EngineError> {
    ensure(step, StepStatus::Running)?;
    if step.status != StepStatus::Paused {
        return Err(EngineError::invalid_step_transition(step.status.as_str(), "running (resume)"));
    }
    set_status(step, StepStatus::Running);
    Ok(())
}

/// `completed -> editing`.
pub fn begin_edit(step: &mut Step) -> Result<(), EngineError> {
    ensure(step, StepStatus::Editing)?;
    set_status(step, StepStatus::Editing);
    Ok(())
}

/// `editing -> completed` with new output. The first edit preserves the
/// agent's original text; later edits leave it as is.
pub fn finish_edit(step: &mut Step, output_text: String) -> Result<(), EngineError> {
    if step.status != StepStatus::Editing {
        return Err(EngineError::invalid_step_transition(step.status.as_str(), "completed (edit)"));
    }
    if step.original_output_text.is_none() {
        step.original_output_text = Some(step.output_text.clone().unwrap_or_default());
    }
    step.output_text = Some(output_text);
    step.output_edited_at = Some(Utc::now());
    set_status(step, StepStatus::Completed);
    Ok(())
}

/// `editing -> completed` keeping the current output.
pub fn discard_edit(step: &mut Step) -> Result<(), EngineError> {
    if step.status != StepStatus::Editing {
        return Err(EngineError::invalid_step_transition(step.status.as_str(), "completed (discard)"));
    }
    set_status(step, StepStatus::Completed);
    Ok(())
}

/// One-shot `completed -> editing -> completed`.
pub fn edit_output(step: &mut Step, output_text: String) -> Result<(), EngineError> {
    begin_edit(step)?;
    finish_edit(step, output_text)
}

/// `failed -> pending`. Bumps `retry_count` and clears the previous
/// attempt's terminal fields; the step keeps its number.
pub fn retry(step: &mut Step) -> Result<(), EngineError> {
    ensure(step, StepStatus::Pending)?;
    step.retry_count += 1;
    step.error_message = None;
    step.output_text = None;
    step.output_structured = None;
    step.original_output_text = None;
    step.output_edited_at = None;
    step.duration_ms = None;
    step.started_at = None;
    step.completed_at = None;
    set_status(step, StepStatus::Pending);
    Ok(())
}

/// `pending|paused -> skipped`.
pub fn skip(step: &mut Step) -> Result<(), EngineError> {
    ensure(step, StepStatus::Skipped)?;
    let now = Utc::now();
    step.output_structured = Some(serde_json::json!({ "skipped": true }));
    if let Some(started) = step.started_at {
        step.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
    }
    step.completed_at = Some(now);
    set_status(step, StepStatus::Skipped);
    Ok(())
}

pub fn record_usage(step: &mut Step, usage: &TokenUsage) {
    step.input_tokens = Some(step.input_tokens.unwrap_or(0) + usage.input_tokens);
    step.output_tokens = Some(step.output_tokens.unwrap_or(0) + usage.output_tokens);
    step.cost_usd = Some(step.cost_usd.unwrap_or(0.0) + usage.estimated_cost_usd());
    step.updated_at = Utc::now();
}

/// Drive the step from one stream event.
///
/// `awaiting_input` and `cancelled` are left to the caller: whether a tool
/// wait pauses the step depends on the pause policy, and what a cancelled
/// run means depends on why it was cancelled.
pub fn apply_event(step: &mut Step, event: &StreamEvent) -> Result<StepEffect, EngineError> {
    match event {
        StreamEvent::PhaseChange { phase } => match phase {
            AgentPhase::Running => {
                if step.status == StepStatus::Paused {
                    resume(step)?;
                    Ok(StepEffect::Updated)
                } else {
                    Ok(StepEffect::Unchanged)
                }
            }
            AgentPhase::AwaitingInput { .. } => Ok(StepEffect::Unchanged),
            AgentPhase::Completed {
                output_text,
                output_structured,
            } => {
                complete(step, output_text.clone(), output_structured.clone())?;
                Ok(StepEffect::Terminal)
            }
            AgentPhase::Failed { error_message } => {
                fail(step, error_message.clone())?;
                Ok(StepEffect::Terminal)
            }
            AgentPhase::Cancelled => Ok(StepEffect::Terminal),
        },
        StreamEvent::Usage { usage } => {
            record_usage(step, usage);
            Ok(StepEffect::Updated)
        }
        StreamEvent::ToolStart { .. }
        | StreamEvent::ToolUpdate { .. }
        | StreamEvent::ToolStop { .. }
        | StreamEvent::TextDelta { .. }
        | StreamEvent::ThinkingStart
        | StreamEvent::ThinkingDelta { .. } => Ok(StepEffect::Unchanged),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(step_type: StepType) -> Step {
        Step::new("s1".into(), "wf".into(), 1, step_type)
    }

    fn completed(text: &str) -> Step {
        let mut s = step(StepType::Planning);
        start(&mut s, Some("prompt".into())).unwrap();
        complete(&mut s, text.into(), None).unwrap();
        s
    }

    #[test]
    fn test_complete_records_output_and_timing() {
        let s = completed("the plan");
        assert_eq!(s.status, StepStatus::Completed);
        assert_eq!(s.output_text.as_deref(), Some("the plan"));
        assert_eq!(s.input_text.as_deref(), Some("prompt"));
        assert!(s.duration_ms.is_some());
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn test_illegal_transitions_are_errors() {
        let mut s = step(StepType::Planning);
        assert!(matches!(
            complete(&mut s, "x".into(), None),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(retry(&mut s).is_err());
        start(&mut s, None).unwrap();
        assert!(skip(&mut s).is_err());
        assert!(begin_edit(&mut s).is_err());
        assert_eq!(s.status, StepStatus::Running);
    }

    #[test]
    fn test_only_clarification_steps_pause() {
        let mut s = step(StepType::Planning);
        start(&mut s, None).unwrap();
        assert!(pause_for_clarification(&mut s).is_err());

        let mut c = step(StepType::Clarification);
        start(&mut c, None).unwrap();
        pause_for_clarification(&mut c).unwrap();
        assert_eq!(c.status, StepStatus::Paused);
        resume(&mut c).unwrap();
        assert_eq!(c.status, StepStatus::Running);
    }

    #[test]
    fn test_first_edit_keeps_original() {
        let mut s = completed("v1");
        edit_output(&mut s, "v2".into()).unwrap();
        assert_eq!(s.original_output_text.as_deref(), Some("v1"));
        let first_edit_at = s.output_edited_at;
        edit_output(&mut s, "v3".into()).unwrap();
        assert_eq!(s.original_output_text.as_deref(), Some("v1"));
        assert_eq!(s.output_text.as_deref(), Some("v3"));
        assert!(s.output_edited_at >= first_edit_at);
        assert_eq!(s.status, StepStatus::Completed);
    }

    #[test]
    fn test_discard_edit_keeps_output() {
        let mut s = completed("v1");
        begin_edit(&mut s).unwrap();
        discard_edit(&mut s).unwrap();
        assert_eq!(s.output_text.as_deref(), Some("v1"));
        assert!(s.original_output_text.is_none());
    }

    #[test]
    fn test_retry_increments_and_clears() {
        let mut s = step(StepType::Discovery);
        for attempt in 1..=3 {
            start(&mut s, None).unwrap();
            fail(&mut s, "boom").unwrap();
            assert_eq!(s.retry_count, attempt - 1);
            retry(&mut s).unwrap();
            assert_eq!(s.retry_count, attempt);
            assert!(s.error_message.is_none());
            assert!(s.output_text.is_none());
            assert_eq!(s.step_number, 1);
        }
    }

    #[test]
    fn test_skip_marks_output() {
        let mut s = step(StepType::Refinement);
        skip(&mut s).unwrap();
        assert_eq!(s.status, StepStatus::Skipped);
        assert_eq!(s.output_structured, Some(json!({"skipped": true})));
        assert!(s.status.is_done());
    }

    #[test]
    fn test_apply_event_drives_lifecycle() {
        let mut s = step(StepType::Clarification);
        start(&mut s, None).unwrap();
        assert_eq!(
            apply_event(&mut s, &StreamEvent::text("hi")).unwrap(),
            StepEffect::Unchanged
        );
        pause_for_clarification(&mut s).unwrap();
        assert_eq!(
            apply_event(&mut s, &StreamEvent::phase(AgentPhase::Running)).unwrap(),
            StepEffect::Updated
        );
        assert_eq!(s.status, StepStatus::Running);

        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 10,
            cost_usd: Some(0.01),
            ..Default::default()
        };
        apply_event(&mut s, &StreamEvent::Usage { usage }).unwrap();
        assert_eq!(s.input_tokens, Some(100));

        let done = StreamEvent::phase(AgentPhase::Completed {
            output_text: "done".into(),
            output_structured: None,
        });
        assert_eq!(apply_event(&mut s, &done).unwrap(), StepEffect::Terminal);
        assert_eq!(s.status, StepStatus::Completed);
    }
}
