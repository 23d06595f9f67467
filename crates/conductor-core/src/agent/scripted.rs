//! Deterministic backend that replays a script of emissions.
//!
//! Used by the integration tests and by `conductor run --dry-run`. Scripts
//! can be registered per step type; steps without a script fall back to the
//! default script, which simply completes with a short summary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::runner::{AgentBackend, AgentOutcome, AgentRequest};
use crate::error::EngineError;
use crate::models::StepType;
use crate::stream::{EventSink, StreamEvent, TokenUsage};

/// One scripted emission.
#[derive(Debug, Clone)]
pub enum ScriptAction {
    Text(String),
    Thinking(Vec<String>),
    /// A tool call the backend resolves itself.
    Tool {
        name: String,
        input: serde_json::Value,
        result: serde_json::Value,
    },
    /// Invoke the clarification tool and block until the caller answers.
    Clarify { input: serde_json::Value },
    /// Invoke an arbitrary tool and block until the caller resolves it.
    AwaitTool {
        name: String,
        input: serde_json::Value,
    },
    Usage(TokenUsage),
    Sleep(Duration),
    /// Finish with this output. Without it the accumulated text is used.
    Succeed(String),
    Fail(String),
    /// Block until cancelled.
    Hang,
    /// Block forever, ignoring cancellation.
    HangStubborn,
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub actions: Vec<ScriptAction>,
    /// Reported turn count.
    pub turns: u32,
}

impl Script {
    pub fn new(actions: Vec<ScriptAction>) -> Self {
        Self { actions, turns: 1 }
    }

    pub fn completing(text: impl Into<String>) -> Self {
        Self::new(vec![ScriptAction::Text(text.into())])
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(vec![ScriptAction::Fail(message.into())])
    }

    pub fn with_turns(mut self, turns: u32) -> Self {
        self.turns = turns;
        self
    }
}

#[derive(Default)]
struct ScriptBook {
    /// Queued scripts per step type, consumed front to back. The last one
    /// is reused once the queue runs dry.
    by_type: HashMap<StepType, Vec<Script>>,
    invocations: Vec<AgentRequest>,
}

#[derive(Default)]
pub struct ScriptedBackend {
    book: Mutex<ScriptBook>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next run of `step_type`.
    pub fn script(self, step_type: StepType, script: Script) -> Self {
        self.push(step_type, script);
        self
    }

    pub fn push(&self, step_type: StepType, script: Script) {
        self.lock()
            .by_type
            .entry(step_type)
            .or_default()
            .push(script);
    }

    /// Requests received so far, in order.
    pub fn invocations(&self) -> Vec<AgentRequest> {
        self.lock().invocations.clone()
    }

    fn next_script(&self, request: &AgentRequest) -> Script {
        let mut book = self.lock();
        book.invocations.push(request.clone());
        match book.by_type.get_mut(&request.step_type) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if queue.len() == 1 => queue[0].clone(),
            _ => Script::completing(format!(
                "{} finished for: {}",
                request.step_type.display_name(),
                first_line(&request.prompt)
            )),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptBook> {
        self.book
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        request: AgentRequest,
        sink: EventSink,
    ) -> Result<AgentOutcome, EngineError> {
        let script = self.next_script(&request);
        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut tool_seq = 0u32;
        let mut next_tool_id = || {
            tool_seq += 1;
            format!("toolu_{}_{}", request.step_number, tool_seq)
        };

        for action in script.actions {
            if sink.is_cancelled() {
                return Err(EngineError::Cancelled("scripted run cancelled".into()));
            }
            match action {
                ScriptAction::Text(chunk) => {
                    text.push_str(&chunk);
                    sink.emit(StreamEvent::text(chunk));
                }
                ScriptAction::Thinking(chunks) => {
                    sink.emit(StreamEvent::ThinkingStart);
                    for chunk in chunks {
                        sink.emit(StreamEvent::ThinkingDelta { text: chunk });
                    }
                }
                ScriptAction::Tool {
                    name,
                    input,
                    result,
                } => {
                    let id = next_tool_id();
                    emit_tool_start(&sink, &id, &name, &input);
                    sink.emit(StreamEvent::ToolStop {
                        tool_use_id: id,
                        result,
                        is_error: false,
                    });
                }
                ScriptAction::Clarify { input } => {
                    let id = next_tool_id();
                    let answer =
                        await_tool(&sink, &id, &request.clarification_tool, &input).await?;
                    text.push_str(&format!("Clarification result: {}\n", answer));
                }
                ScriptAction::AwaitTool { name, input } => {
                    let id = next_tool_id();
                    await_tool(&sink, &id, &name, &input).await?;
                }
                ScriptAction::Usage(u) => usage.accumulate(&u),
                ScriptAction::Sleep(d) => {
                    let cancel = sink.cancellation();
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = cancel.cancelled() => {
                            return Err(EngineError::Cancelled("scripted run cancelled".into()));
                        }
                    }
                }
                ScriptAction::Succeed(output) => {
                    return Ok(AgentOutcome {
                        output_text: output,
                        output_structured: None,
                        usage,
                        turns: script.turns,
                    });
                }
                ScriptAction::Fail(message) => return Err(EngineError::AgentExecution(message)),
                ScriptAction::Hang => {
                    sink.cancellation().cancelled().await;
                    return Err(EngineError::Cancelled("scripted run cancelled".into()));
                }
                ScriptAction::HangStubborn => std::future::pending::<()>().await,
            }
        }

        Ok(AgentOutcome {
            output_text: text,
            output_structured: None,
            usage,
            turns: script.turns,
        })
    }
}

fn emit_tool_start(sink: &EventSink, id: &str, name: &str, input: &serde_json::Value) {
    sink.emit(StreamEvent::ToolStart {
        tool_use_id: id.to_string(),
        tool_name: name.to_string(),
        tool_input: input.clone(),
    });
    sink.emit(StreamEvent::ToolUpdate {
        tool_use_id: id.to_string(),
        partial_json: input.to_string(),
        input: Some(input.clone()),
    });
}

async fn await_tool(
    sink: &EventSink,
    id: &str,
    name: &str,
    input: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    emit_tool_start(sink, id, name, input);
    let answer = sink.await_tool_result(id).await?;
    sink.emit(StreamEvent::ToolStop {
        tool_use_id: id.to_string(),
        result: answer.clone(),
        is_error: false,
    });
    Ok(answer)
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("")
}

/// A typical clarification tool input, handy for demos and tests.
pub fn sample_clarification_input() -> serde_json::Value {
    json!({
        "assessment": "The request does not say which identity providers to support.",
        "questions": [
            {
                "header": "Providers",
                "question": "Which OAuth providers should be supported?",
                "options": [
                    {"label": "GitHub", "description": "GitHub OAuth app"},
                    {"label": "Google", "description": "Google identity"}
                ],
                "multiSelect": true
            },
            {
                "header": "Sessions",
                "question": "How should sessions be stored?",
                "options": [
                    {"label": "Cookie"},
                    {"label": "Database"}
                ],
                "multiSelect": false
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::runner::AgentRunner;
    use crate::stream::AgentPhase;
    use std::sync::Arc;

    fn request(step_type: StepType) -> AgentRequest {
        AgentRequest {
            workflow_id: "wf".into(),
            step_id: "s".into(),
            step_number: 1,
            step_type,
            prompt: "Add OAuth login\nmore".into(),
            max_turns: 0,
            clarification_tool: "AskUserQuestion".into(),
        }
    }

    #[tokio::test]
    async fn test_default_script_completes() {
        let backend = Arc::new(ScriptedBackend::new());
        let runner = AgentRunner::new(backend.clone(), 16, Duration::from_millis(50));
        let mut run = runner.run(request(StepType::Planning));
        let mut last = None;
        while let Some(event) = run.events.recv().await {
            last = Some(event);
        }
        match last {
            Some(StreamEvent::PhaseChange {
                phase: AgentPhase::Completed { output_text, .. },
            }) => assert_eq!(output_text, "Plan Implementation finished for: Add OAuth login"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(backend.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_scripts_are_consumed_in_order() {
        let backend = ScriptedBackend::new()
            .script(StepType::Discovery, Script::failing("first"))
            .script(StepType::Discovery, Script::completing("second"));
        let req = request(StepType::Discovery);
        assert_eq!(backend.next_script(&req).actions.len(), 1);
        let second = backend.next_script(&req);
        assert!(matches!(&second.actions[0], ScriptAction::Text(t) if t == "second"));
        // The last script sticks.
        let third = backend.next_script(&req);
        assert!(matches!(&third.actions[0], ScriptAction::Text(t) if t == "second"));
    }

    #[tokio::test]
    async fn test_clarify_waits_for_result() {
        let backend = ScriptedBackend::new().script(
            StepType::Clarification,
            Script::new(vec![ScriptAction::Clarify {
                input: sample_clarification_input(),
            }]),
        );
        let runner = AgentRunner::new(Arc::new(backend), 16, Duration::from_millis(50));
        let mut run = runner.run(request(StepType::Clarification));
        loop {
            match run.events.recv().await {
                Some(StreamEvent::PhaseChange {
                    phase: AgentPhase::AwaitingInput { tool_use_id },
                }) => {
                    run.channel
                        .send_result(&tool_use_id, json!({"skipped": true}))
                        .unwrap();
                }
                Some(event) if event.is_terminal() => {
                    assert!(matches!(
                        event,
                        StreamEvent::PhaseChange {
                            phase: AgentPhase::Completed { .. }
                        }
                    ));
                    break;
                }
                Some(_) => {}
                None => panic!("stream ended without terminal event"),
            }
        }
    }
}
