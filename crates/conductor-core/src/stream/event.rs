//! Canonical agent event vocabulary.
//!
//! Every backend translates its raw protocol into these events. Tool events
//! share a `toolUseId` so observers can correlate start, updates, and stop.

use serde::{Deserialize, Serialize};

/// Claude Sonnet list pricing, used when a backend reports tokens but no cost.
const DEFAULT_INPUT_USD_PER_MTOK: f64 = 3.0;
const DEFAULT_OUTPUT_USD_PER_MTOK: f64 = 15.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum StreamEvent {
    ToolStart {
        tool_use_id: String,
        tool_name: String,
        #[serde(default)]
        tool_input: serde_json::Value,
    },
    ToolUpdate {
        tool_use_id: String,
        #[serde(default)]
        partial_json: String,
        /// Set once the arguments have been fully assembled.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
    },
    ToolStop {
        tool_use_id: String,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    TextDelta {
        text: String,
    },
    ThinkingStart,
    ThinkingDelta {
        text: String,
    },
    PhaseChange {
        phase: AgentPhase,
    },
    Usage {
        usage: TokenUsage,
    },
}

/// Phase of one agent run. The last three are terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "status",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum AgentPhase {
    Running,
    AwaitingInput {
        tool_use_id: String,
    },
    Completed {
        output_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_structured: Option<serde_json::Value>,
    },
    Failed {
        error_message: String,
    },
    Cancelled,
}

impl AgentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl TokenUsage {
    /// Reported cost, or an estimate from token counts at list pricing.
    pub fn estimated_cost_usd(&self) -> f64 {
        self.cost_usd.unwrap_or_else(|| {
            (self.input_tokens as f64 * DEFAULT_INPUT_USD_PER_MTOK
                + self.output_tokens as f64 * DEFAULT_OUTPUT_USD_PER_MTOK)
                / 1_000_000.0
        })
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cost_usd = match (self.cost_usd, other.cost_usd) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

impl StreamEvent {
    /// snake_case kind, as persisted in the activity log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolStart { .. } => "tool_start",
            Self::ToolUpdate { .. } => "tool_update",
            Self::ToolStop { .. } => "tool_stop",
            Self::TextDelta { .. } => "text_delta",
            Self::ThinkingStart => "thinking_start",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::PhaseChange { .. } => "phase_change",
            Self::Usage { .. } => "usage",
        }
    }

    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            Self::ToolStart { tool_use_id, .. }
            | Self::ToolUpdate { tool_use_id, .. }
            | Self::ToolStop { tool_use_id, .. } => Some(tool_use_id),
            Self::PhaseChange {
                phase: AgentPhase::AwaitingInput { tool_use_id },
            } => Some(tool_use_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PhaseChange { phase } if phase.is_terminal())
    }

    /// Slow observers may lose these under buffer pressure. Tool boundaries
    /// and terminal phases are always delivered.
    pub fn is_droppable(&self) -> bool {
        !matches!(self, Self::ToolStart { .. } | Self::ToolStop { .. }) && !self.is_terminal()
    }

    pub fn phase(phase: AgentPhase) -> Self {
        Self::PhaseChange { phase }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_start_wire_shape() {
        let event = StreamEvent::ToolStart {
            tool_use_id: "toolu_1".into(),
            tool_name: "Read".into(),
            tool_input: json!({"file_path": "src/main.rs"}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_start");
        assert_eq!(value["toolUseId"], "toolu_1");
        assert_eq!(value["toolName"], "Read");
        assert_eq!(event.kind(), "tool_start");
        assert_eq!(event.tool_use_id(), Some("toolu_1"));
    }

    #[test]
    fn test_phase_change_wire_shape() {
        let event = StreamEvent::phase(AgentPhase::Failed {
            error_message: "model overloaded".into(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "phase_change");
        assert_eq!(value["phase"]["status"], "failed");
        assert_eq!(value["phase"]["errorMessage"], "model overloaded");

        let back: StreamEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert!(back.is_terminal());
    }

    #[test]
    fn test_droppable_classification() {
        assert!(StreamEvent::text("hi").is_droppable());
        assert!(StreamEvent::ThinkingStart.is_droppable());
        assert!(StreamEvent::phase(AgentPhase::Running).is_droppable());
        assert!(!StreamEvent::phase(AgentPhase::Cancelled).is_droppable());
        assert!(!StreamEvent::ToolStop {
            tool_use_id: "t".into(),
            result: json!(null),
            is_error: false,
        }
        .is_droppable());
    }

    #[test]
    fn test_usage_cost_estimate() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            ..Default::default()
        };
        assert!((usage.estimated_cost_usd() - 4.5).abs() < 1e-9);

        let reported = TokenUsage {
            cost_usd: Some(0.25),
            ..usage
        };
        assert_eq!(reported.estimated_cost_usd(), 0.25);
    }

    #[test]
    fn test_usage_accumulate() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            cost_usd: Some(0.1),
            ..Default::default()
        });
        total.accumulate(&TokenUsage {
            input_tokens: 3,
            output_tokens: 2,
            cost_usd: None,
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.cost_usd, Some(0.1));
    }
}
