use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable record of one stream event, kept for audit and replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub workflow_id: String,
    pub step_id: String,
    /// snake_case event kind, e.g. `tool_start`.
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    /// The serialized event.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
