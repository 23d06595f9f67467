//! Agent runner: drives one backend invocation per step.
//!
//! The runner owns the terminal event: backends only stream content and
//! return an [`AgentOutcome`] (or an error), and the runner turns that into
//! `usage` plus a terminal `phase_change`. Cancellation is cooperative first;
//! a backend that ignores the signal past the grace period is aborted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::models::StepType;
use crate::stream::{AgentPhase, EventSink, StreamChannel, StreamEvent, Subscription, TokenUsage};

/// Everything a backend needs to run one step.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workflow_id: String,
    pub step_id: String,
    pub step_number: u32,
    pub step_type: StepType,
    pub prompt: String,
    /// 0 disables the limit.
    pub max_turns: u32,
    /// Tool name that routes to a human instead of being auto-resolved.
    pub clarification_tool: String,
}

/// What a backend returns when the agent finishes normally.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub output_text: String,
    pub output_structured: Option<serde_json::Value>,
    pub usage: TokenUsage,
    pub turns: u32,
}

/// An underlying model/CLI integration.
///
/// Implementations emit content events (`text_delta`, `thinking_*`,
/// `tool_*`) through the sink and use [`EventSink::await_tool_result`] for
/// tool calls that need a caller-supplied result. They must not emit
/// terminal phase changes.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        request: AgentRequest,
        sink: EventSink,
    ) -> Result<AgentOutcome, EngineError>;
}

/// A started agent run.
pub struct AgentRun {
    pub channel: StreamChannel,
    /// Lossless subscription opened before the first event.
    pub events: Subscription<StreamEvent>,
    handle: JoinHandle<()>,
}

impl AgentRun {
    /// Wait for the runner task to exit.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!("[Runner] task join error: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct AgentRunner {
    backend: Arc<dyn AgentBackend>,
    channel_capacity: usize,
    cancel_grace: Duration,
}

impl AgentRunner {
    pub fn new(backend: Arc<dyn AgentBackend>, channel_capacity: usize, cancel_grace: Duration) -> Self {
        Self {
            backend,
            channel_capacity,
            cancel_grace,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Start the backend in the background and return its channel.
    pub fn run(&self, request: AgentRequest) -> AgentRun {
        let (channel, sink) = StreamChannel::open(self.channel_capacity);
        let events = channel.subscribe_lossless();
        let handle = tokio::spawn(drive(
            self.backend.clone(),
            request,
            sink,
            self.cancel_grace,
        ));
        AgentRun {
            channel,
            events,
            handle,
        }
    }
}

enum Finish {
    Returned(Result<AgentOutcome, EngineError>),
    Panicked(String),
    Cancelled,
}

async fn drive(
    backend: Arc<dyn AgentBackend>,
    request: AgentRequest,
    sink: EventSink,
    grace: Duration,
) {
    let label = format!(
        "{}:{}#{}",
        backend.name(),
        request.workflow_id,
        request.step_number
    );
    let max_turns = request.max_turns;
    let cancel = sink.cancellation();

    sink.emit(StreamEvent::phase(AgentPhase::Running));
    tracing::debug!("[Runner:{}] started ({})", label, request.step_type.as_str());

    let mut work = tokio::spawn({
        let sink = sink.clone();
        async move { backend.execute(request, sink).await }
    });

    let finish = tokio::select! {
        joined = &mut work => match joined {
            Ok(result) => Finish::Returned(result),
            Err(e) => Finish::Panicked(e.to_string()),
        },
        _ = cancel.cancelled() => {
            if tokio::time::timeout(grace, &mut work).await.is_err() {
                tracing::warn!(
                    "[Runner:{}] backend ignored cancellation for {:?}; terminating",
                    label,
                    grace
                );
                work.abort();
            }
            Finish::Cancelled
        }
    };

    let terminal = match finish {
        Finish::Cancelled | Finish::Returned(Err(EngineError::Cancelled(_))) => AgentPhase::Cancelled,
        Finish::Returned(Ok(outcome)) if max_turns > 0 && outcome.turns > max_turns => {
            sink.emit(StreamEvent::Usage {
                usage: outcome.usage,
            });
            AgentPhase::Failed {
                error_message: format!(
                    "Agent exceeded the maximum of {} turns ({} used)",
                    max_turns, outcome.turns
                ),
            }
        }
        Finish::Returned(Ok(outcome)) => {
            sink.emit(StreamEvent::Usage {
                usage: outcome.usage,
            });
            AgentPhase::Completed {
                output_text: outcome.output_text,
                output_structured: outcome.output_structured,
            }
        }
        Finish::Returned(Err(e)) => AgentPhase::Failed {
            error_message: failure_message(e),
        },
        Finish::Panicked(e) => AgentPhase::Failed {
            error_message: format!("Agent task crashed: {}", e),
        },
    };

    match &terminal {
        AgentPhase::Failed { error_message } => {
            tracing::warn!("[Runner:{}] failed: {}", label, error_message)
        }
        _ => tracing::debug!("[Runner:{}] finished", label),
    }
    sink.emit(StreamEvent::phase(terminal));
}

fn failure_message(e: EngineError) -> String {
    match e {
        EngineError::AgentExecution(msg) => msg,
        other => other.to_string(),
    }
}
