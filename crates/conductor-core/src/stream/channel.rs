//! Stream channel: the duplex conduit between one agent run and its observers.
//!
//! Downstream it carries [`StreamEvent`]s from the runner to any number of
//! subscribers; upstream it carries tool results supplied by a caller back to
//! the runner. The channel closes on the first terminal `phase_change`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::event::{AgentPhase, StreamEvent};
use super::fanout::{Fanout, FanoutItem, Subscription};
use crate::error::EngineError;

impl FanoutItem for StreamEvent {
    fn is_droppable(&self) -> bool {
        StreamEvent::is_droppable(self)
    }

    fn is_terminal(&self) -> bool {
        StreamEvent::is_terminal(self)
    }
}

#[derive(Default)]
struct ToolLedger {
    waiting: HashMap<String, oneshot::Sender<serde_json::Value>>,
    resolved: HashSet<String>,
}

struct ChannelShared {
    id: String,
    events: Fanout<StreamEvent>,
    tools: Mutex<ToolLedger>,
    cancel: CancellationToken,
}

/// Observer/control handle: subscribe, answer tool calls, cancel.
#[derive(Clone)]
pub struct StreamChannel {
    shared: Arc<ChannelShared>,
}

/// Producer handle held by the agent runner and its backend.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<ChannelShared>,
}

impl StreamChannel {
    /// Open a channel whose bounded observers buffer up to `capacity` events.
    pub fn open(capacity: usize) -> (StreamChannel, EventSink) {
        let shared = Arc::new(ChannelShared {
            id: uuid::Uuid::new_v4().to_string(),
            events: Fanout::new(capacity),
            tools: Mutex::new(ToolLedger::default()),
            cancel: CancellationToken::new(),
        });
        (
            StreamChannel {
                shared: shared.clone(),
            },
            EventSink { shared },
        )
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Events from now on, with drop-oldest buffering for slow readers.
    pub fn subscribe(&self) -> Subscription<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Events from now on, never dropped. Reserved for consumers that drive
    /// state from the stream.
    pub fn subscribe_lossless(&self) -> Subscription<StreamEvent> {
        self.shared.events.subscribe_lossless()
    }

    /// Resolve an open tool call. Unknown, already-resolved, and post-close
    /// ids are rejected as protocol errors.
    pub fn send_result(
        &self,
        tool_use_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), EngineError> {
        if self.shared.events.is_closed() {
            return Err(EngineError::Protocol(format!(
                "channel {} is closed; cannot resolve tool use {}",
                self.shared.id, tool_use_id
            )));
        }
        let mut tools = lock(&self.shared.tools);
        if tools.resolved.contains(tool_use_id) {
            return Err(EngineError::Protocol(format!(
                "tool use {} was already resolved",
                tool_use_id
            )));
        }
        let Some(sender) = tools.waiting.remove(tool_use_id) else {
            return Err(EngineError::Protocol(format!(
                "unknown tool use id {}",
                tool_use_id
            )));
        };
        let _ = tools.resolved.insert(tool_use_id.to_string());
        sender.send(payload).map_err(|_| {
            EngineError::Protocol(format!(
                "runner stopped waiting for tool use {}",
                tool_use_id
            ))
        })
    }

    /// Ask the runner to stop. Idempotent.
    pub fn cancel(&self) {
        if !self.shared.cancel.is_cancelled() {
            tracing::debug!("[StreamChannel:{}] cancel requested", self.shared.id);
        }
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.events.is_closed()
    }

    /// Tool use ids the runner is currently blocked on.
    pub fn awaiting_tool_uses(&self) -> Vec<String> {
        lock(&self.shared.tools).waiting.keys().cloned().collect()
    }
}

impl EventSink {
    /// Publish an event. Events after the terminal one are discarded.
    pub fn emit(&self, event: StreamEvent) {
        let terminal = event.is_terminal();
        if !self.shared.events.publish(event) {
            tracing::debug!(
                "[StreamChannel:{}] dropping event emitted after close",
                self.shared.id
            );
            return;
        }
        if terminal {
            // Outstanding waits can never be answered now.
            lock(&self.shared.tools).waiting.clear();
        }
    }

    /// Block until a caller resolves `tool_use_id` through
    /// [`StreamChannel::send_result`]. Emits `awaiting_input` while waiting
    /// and `running` once answered.
    pub async fn await_tool_result(
        &self,
        tool_use_id: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut tools = lock(&self.shared.tools);
            if tools.resolved.contains(tool_use_id) || tools.waiting.contains_key(tool_use_id) {
                return Err(EngineError::Protocol(format!(
                    "tool use {} is already registered",
                    tool_use_id
                )));
            }
            let _ = tools.waiting.insert(tool_use_id.to_string(), tx);
        }
        self.emit(StreamEvent::phase(AgentPhase::AwaitingInput {
            tool_use_id: tool_use_id.to_string(),
        }));

        let result = tokio::select! {
            answer = rx => answer.map_err(|_| {
                EngineError::Cancelled(format!("channel closed while awaiting {}", tool_use_id))
            }),
            _ = self.shared.cancel.cancelled() => Err(EngineError::Cancelled(format!(
                "cancelled while awaiting {}",
                tool_use_id
            ))),
        };

        if result.is_err() {
            let _ = lock(&self.shared.tools).waiting.remove(tool_use_id);
        } else {
            self.emit(StreamEvent::phase(AgentPhase::Running));
        }
        result
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.events.is_closed()
    }

    pub fn channel_id(&self) -> &str {
        &self.shared.id
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_result_resolves_waiting_runner() {
        let (channel, sink) = StreamChannel::open(8);
        let mut events = channel.subscribe_lossless();

        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.await_tool_result("toolu_1").await })
        };

        // Wait until the runner has registered the tool use.
        let awaiting = events.recv().await.unwrap();
        assert_eq!(awaiting.tool_use_id(), Some("toolu_1"));

        channel
            .send_result("toolu_1", json!({"answers": {"db": "postgres"}}))
            .unwrap();
        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value["answers"]["db"], "postgres");
        assert_eq!(
            events.recv().await,
            Some(StreamEvent::phase(AgentPhase::Running))
        );
    }

    #[tokio::test]
    async fn test_double_resolve_is_protocol_error() {
        let (channel, sink) = StreamChannel::open(8);
        let mut events = channel.subscribe_lossless();
        let waiter = tokio::spawn({
            let sink = sink.clone();
            async move { sink.await_tool_result("toolu_1").await }
        });
        let _ = events.recv().await;

        channel.send_result("toolu_1", json!({"skipped": true})).unwrap();
        let second = channel.send_result("toolu_1", json!({"skipped": true}));
        assert!(matches!(second, Err(EngineError::Protocol(_))));
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_tool_use_is_protocol_error() {
        let (channel, _sink) = StreamChannel::open(8);
        let err = channel.send_result("nope", json!({})).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_cancel_releases_waiting_runner() {
        let (channel, sink) = StreamChannel::open(8);
        let mut events = channel.subscribe_lossless();
        let waiter = tokio::spawn({
            let sink = sink.clone();
            async move { sink.await_tool_result("toolu_9").await }
        });
        let _ = events.recv().await;

        channel.cancel();
        channel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled(_))));
        assert!(channel.awaiting_tool_uses().is_empty());
    }

    #[tokio::test]
    async fn test_send_result_after_close_is_rejected() {
        let (channel, sink) = StreamChannel::open(8);
        sink.emit(StreamEvent::phase(AgentPhase::Cancelled));
        assert!(channel.is_closed());
        let err = channel.send_result("toolu_1", json!({})).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));

        // Emission after close is a silent no-op.
        sink.emit(StreamEvent::text("late"));
        let mut sub = channel.subscribe();
        assert_eq!(
            sub.recv().await,
            Some(StreamEvent::phase(AgentPhase::Cancelled))
        );
        assert_eq!(sub.recv().await, None);
    }
}
