//! Clarification resolver: the human-in-the-loop sub-protocol.
//!
//! The resolver recognises the clarification tool by name, captures its
//! structured question set, and once the step finishes folds the questions
//! and the caller's answers into the step's `outputStructured`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::stream::StreamEvent;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClarificationOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationQuestion {
    #[serde(default)]
    pub header: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<ClarificationOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// The question set carried by the clarification tool's input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClarificationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<String>,
    #[serde(default)]
    pub questions: Vec<ClarificationQuestion>,
}

impl ClarificationRequest {
    /// Parse a tool input. Questions that cannot be read are dropped rather
    /// than failing the whole set; models are not always precise.
    pub fn from_tool_input(input: &Value) -> Self {
        let assessment = input
            .get("assessment")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let questions = input
            .get("questions")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|q| match serde_json::from_value(q.clone()) {
                        Ok(question) => Some(question),
                        Err(e) => {
                            tracing::warn!("[Clarification] dropping unreadable question: {}", e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            assessment,
            questions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// What the caller supplied for a clarification.
#[derive(Debug, Clone, PartialEq)]
pub enum ClarificationResponse {
    /// Answers keyed by question header (or question text when no header).
    Answers(BTreeMap<String, Value>),
    Skipped,
}

impl ClarificationResponse {
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Answers(answers) => json!({ "answers": answers }),
            Self::Skipped => json!({ "skipped": true }),
        }
    }

    /// Parse `{answers: {...}}` or `{skipped: true}`.
    pub fn from_payload(payload: &Value) -> Result<Self, EngineError> {
        if payload.get("skipped").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(Self::Skipped);
        }
        match payload.get("answers") {
            Some(Value::Object(map)) => Ok(Self::Answers(
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            _ => Err(EngineError::Protocol(
                "clarification result must be {answers: {...}} or {skipped: true}".to_string(),
            )),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// One clarification tool call, from `tool_start` to resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ClarificationExchange {
    pub tool_use_id: String,
    pub request: ClarificationRequest,
    pub response: Option<ClarificationResponse>,
}

impl ClarificationExchange {
    /// Record the caller's response. Only the first one counts.
    pub fn resolve(&mut self, response: ClarificationResponse) -> Result<(), EngineError> {
        if self.response.is_some() {
            return Err(EngineError::Protocol(format!(
                "clarification {} was already resolved",
                self.tool_use_id
            )));
        }
        self.response = Some(response);
        Ok(())
    }
}

/// Serialized view of a pending clarification for callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingClarification {
    pub workflow_id: String,
    pub step_id: String,
    pub tool_use_id: String,
    #[serde(flatten)]
    pub request: ClarificationRequest,
}

#[derive(Debug, Clone)]
pub struct ClarificationResolver {
    tool_name: String,
}

impl ClarificationResolver {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// A new exchange if `event` is the clarification tool starting.
    pub fn detect(&self, event: &StreamEvent) -> Option<ClarificationExchange> {
        match event {
            StreamEvent::ToolStart {
                tool_use_id,
                tool_name,
                tool_input,
            } if *tool_name == self.tool_name => Some(ClarificationExchange {
                tool_use_id: tool_use_id.clone(),
                request: ClarificationRequest::from_tool_input(tool_input),
                response: None,
            }),
            _ => None,
        }
    }

    /// Streaming backends only know the full tool input once arguments are
    /// assembled; refresh the question set when they are.
    pub fn observe_update(&self, exchange: &mut ClarificationExchange, event: &StreamEvent) {
        if let StreamEvent::ToolUpdate {
            tool_use_id,
            input: Some(input),
            ..
        } = event
        {
            if *tool_use_id == exchange.tool_use_id {
                let request = ClarificationRequest::from_tool_input(input);
                if !request.is_empty() || exchange.request.is_empty() {
                    exchange.request = request;
                }
            }
        }
    }

    /// Fold resolved exchanges into a step's structured output.
    ///
    /// Answers produce `{assessment, questions, answers}`; a skip produces
    /// `{questions, skipped: true}` with no `answers` key. Multiple exchanges
    /// within one step are kept under `rounds`, the last one on top.
    pub fn fold(&self, exchanges: &[ClarificationExchange], existing: Option<&Value>) -> Option<Value> {
        let last = exchanges.last()?;
        let mut folded = serde_json::Map::new();
        if let Some(Value::Object(prev)) = existing {
            for (k, v) in prev {
                folded.insert(k.clone(), v.clone());
            }
        }
        if let Some(assessment) = &last.request.assessment {
            folded.insert("assessment".into(), json!(assessment));
        }
        folded.insert("questions".into(), json!(last.request.questions));
        match &last.response {
            Some(ClarificationResponse::Answers(answers)) => {
                folded.remove("skipped");
                folded.insert("answers".into(), json!(answers));
            }
            Some(ClarificationResponse::Skipped) | None => {
                folded.remove("answers");
                folded.insert("skipped".into(), json!(true));
            }
        }
        if exchanges.len() > 1 {
            let rounds: Vec<Value> = exchanges.iter().map(round_value).collect();
            folded.insert("rounds".into(), Value::Array(rounds));
        }
        Some(Value::Object(folded))
    }
}

fn round_value(exchange: &ClarificationExchange) -> Value {
    let mut round = json!({
        "toolUseId": exchange.tool_use_id,
        "questions": exchange.request.questions,
    });
    match &exchange.response {
        Some(ClarificationResponse::Answers(answers)) => round["answers"] = json!(answers),
        _ => round["skipped"] = json!(true),
    }
    round
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_start(name: &str, input: Value) -> StreamEvent {
        StreamEvent::ToolStart {
            tool_use_id: "toolu_1".into(),
            tool_name: name.into(),
            tool_input: input,
        }
    }

    fn input() -> Value {
        json!({
            "assessment": "Ambiguous provider list",
            "questions": [
                {"header": "Providers", "question": "Which providers?",
                 "options": [{"label": "GitHub"}, {"label": "Google"}], "multiSelect": true},
                {"question": 42}
            ]
        })
    }

    #[test]
    fn test_detect_only_matches_configured_tool() {
        let resolver = ClarificationResolver::new("AskUserQuestion");
        assert!(resolver.detect(&tool_start("Read", json!({}))).is_none());
        let exchange = resolver
            .detect(&tool_start("AskUserQuestion", input()))
            .unwrap();
        assert_eq!(exchange.tool_use_id, "toolu_1");
        // The malformed second question is dropped.
        assert_eq!(exchange.request.questions.len(), 1);
        assert!(exchange.request.questions[0].multi_select);
    }

    #[test]
    fn test_update_fills_in_streamed_input() {
        let resolver = ClarificationResolver::new("AskUserQuestion");
        let mut exchange = resolver
            .detect(&tool_start("AskUserQuestion", json!({})))
            .unwrap();
        assert!(exchange.request.is_empty());
        resolver.observe_update(
            &mut exchange,
            &StreamEvent::ToolUpdate {
                tool_use_id: "toolu_1".into(),
                partial_json: String::new(),
                input: Some(input()),
            },
        );
        assert_eq!(exchange.request.assessment.as_deref(), Some("Ambiguous provider list"));
    }

    #[test]
    fn test_fold_skipped_keeps_questions_without_answers() {
        let resolver = ClarificationResolver::new("AskUserQuestion");
        let mut exchange = resolver
            .detect(&tool_start("AskUserQuestion", input()))
            .unwrap();
        exchange.resolve(ClarificationResponse::Skipped).unwrap();
        let folded = resolver.fold(&[exchange.clone()], None).unwrap();
        assert_eq!(folded["questions"], json!(exchange.request.questions));
        assert_eq!(folded["skipped"], true);
        assert!(folded.get("answers").is_none());
    }

    #[test]
    fn test_fold_answers() {
        let resolver = ClarificationResolver::new("AskUserQuestion");
        let mut exchange = resolver
            .detect(&tool_start("AskUserQuestion", input()))
            .unwrap();
        let answers: BTreeMap<String, Value> =
            [("Providers".to_string(), json!(["GitHub"]))].into_iter().collect();
        exchange
            .resolve(ClarificationResponse::Answers(answers))
            .unwrap();
        assert!(exchange.resolve(ClarificationResponse::Skipped).is_err());

        let folded = resolver.fold(&[exchange], None).unwrap();
        assert_eq!(folded["answers"]["Providers"], json!(["GitHub"]));
        assert_eq!(folded["assessment"], "Ambiguous provider list");
        assert!(folded.get("skipped").is_none());
    }

    #[test]
    fn test_response_payload_round_trip() {
        let payload = json!({"answers": {"Sessions": "Cookie"}});
        let response = ClarificationResponse::from_payload(&payload).unwrap();
        assert_eq!(response.to_payload(), payload);
        assert!(ClarificationResponse::from_payload(&json!({"skipped": true}))
            .unwrap()
            .is_skipped());
        assert!(ClarificationResponse::from_payload(&json!({"nope": 1})).is_err());
    }
}
