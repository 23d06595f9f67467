//! Claude Code backend using the stream-json protocol.
//!
//! Claude Code speaks NDJSON on stdin/stdout:
//!   - Message types: system, assistant, user, result, stream_event
//!   - With `--include-partial-messages`, content blocks stream as
//!     `stream_event` start/delta/stop triples.
//!
//! [`ClaudeStreamParser`] is a pure translator from those lines to the
//! canonical [`StreamEvent`] vocabulary; [`ClaudeCodeBackend`] owns the child
//! process and feeds it.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};

use super::runner::{AgentBackend, AgentOutcome, AgentRequest};
use crate::config::ClaudeSettings;
use crate::error::EngineError;
use crate::stream::{EventSink, StreamEvent, TokenUsage};

// ─── Claude Protocol Types ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct ClaudeStreamDelta {
    #[serde(rename = "type", default)]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeStreamContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeStreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    index: Option<i64>,
    content_block: Option<ClaudeStreamContentBlock>,
    delta: Option<ClaudeStreamDelta>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
    tool_use_id: Option<String>,
    content: Option<serde_json::Value>,
    is_error: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeMessage {
    #[serde(default)]
    content: Vec<ClaudeContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeOutputMessage {
    #[serde(rename = "type")]
    msg_type: String,
    subtype: Option<String>,
    session_id: Option<String>,
    message: Option<ClaudeMessage>,
    event: Option<ClaudeStreamEvent>,
    result: Option<String>,
    is_error: Option<bool>,
    usage: Option<ClaudeUsage>,
    total_cost_usd: Option<f64>,
    num_turns: Option<u32>,
}

// ─── Parser ─────────────────────────────────────────────────────────────

/// Final `result` line of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaudeResult {
    pub text: String,
    pub is_error: bool,
    pub subtype: Option<String>,
    pub usage: TokenUsage,
    pub num_turns: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    Event(StreamEvent),
    /// The clarification tool was invoked with complete input; the caller
    /// must supply its result.
    AwaitTool { tool_use_id: String },
    Finished(ClaudeResult),
}

pub struct ClaudeStreamParser {
    clarification_tool: String,
    session_id: Option<String>,
    block_tools: HashMap<i64, String>,
    partial_inputs: HashMap<String, String>,
    started_tools: HashSet<String>,
    awaited_tools: HashSet<String>,
    streamed_text: bool,
    text: String,
    messages: u32,
}

impl ClaudeStreamParser {
    pub fn new(clarification_tool: impl Into<String>) -> Self {
        Self {
            clarification_tool: clarification_tool.into(),
            session_id: None,
            block_tools: HashMap::new(),
            partial_inputs: HashMap::new(),
            started_tools: HashSet::new(),
            awaited_tools: HashSet::new(),
            streamed_text: false,
            text: String::new(),
            messages: 0,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// All assistant text seen so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Assistant messages seen so far, used when no `num_turns` is reported.
    pub fn turns(&self) -> u32 {
        self.messages
    }

    pub fn feed(&mut self, raw: &str) -> Vec<ParsedOutput> {
        let line = clear_ansi(raw.trim());
        if line.is_empty() || !line.starts_with('{') {
            return Vec::new();
        }
        match serde_json::from_str::<ClaudeOutputMessage>(&line) {
            Ok(msg) => self.handle(msg),
            Err(e) => {
                tracing::debug!(
                    "[ClaudeCode] Failed to parse: {} - {}",
                    e,
                    line.chars().take(100).collect::<String>()
                );
                Vec::new()
            }
        }
    }

    fn handle(&mut self, msg: ClaudeOutputMessage) -> Vec<ParsedOutput> {
        let mut out = Vec::new();
        match msg.msg_type.as_str() {
            "system" => {
                if msg.subtype.as_deref() == Some("init") {
                    self.session_id = msg.session_id;
                }
            }
            "stream_event" => {
                if let Some(event) = msg.event {
                    self.stream_event(event, &mut out);
                }
            }
            "assistant" => {
                self.messages += 1;
                for c in msg.message.map(|m| m.content).unwrap_or_default() {
                    match c.content_type.as_str() {
                        "text" if !self.streamed_text => {
                            if let Some(text) = c.text {
                                self.text.push_str(&text);
                                out.push(ParsedOutput::Event(StreamEvent::text(text)));
                            }
                        }
                        "tool_use" => {
                            let id = c.id.unwrap_or_default();
                            let name = c.name.unwrap_or_else(|| "unknown".to_string());
                            let input = c.input.unwrap_or_else(|| serde_json::json!({}));
                            if self.started_tools.insert(id.clone()) {
                                out.push(ParsedOutput::Event(StreamEvent::ToolStart {
                                    tool_use_id: id.clone(),
                                    tool_name: name.clone(),
                                    tool_input: input.clone(),
                                }));
                                out.push(ParsedOutput::Event(StreamEvent::ToolUpdate {
                                    tool_use_id: id.clone(),
                                    partial_json: String::new(),
                                    input: Some(input),
                                }));
                            }
                            if name == self.clarification_tool && self.awaited_tools.insert(id.clone()) {
                                out.push(ParsedOutput::AwaitTool { tool_use_id: id });
                            }
                        }
                        _ => {}
                    }
                }
            }
            "user" => {
                for c in msg.message.map(|m| m.content).unwrap_or_default() {
                    if c.content_type != "tool_result" {
                        continue;
                    }
                    let id = c.tool_use_id.unwrap_or_default();
                    // Human-resolved tools get their stop from the caller's answer.
                    if self.awaited_tools.contains(&id) {
                        continue;
                    }
                    out.push(ParsedOutput::Event(StreamEvent::ToolStop {
                        tool_use_id: id,
                        result: c.content.unwrap_or(serde_json::Value::Null),
                        is_error: c.is_error.unwrap_or(false),
                    }));
                }
            }
            "result" => {
                let usage = msg.usage.unwrap_or_default();
                out.push(ParsedOutput::Finished(ClaudeResult {
                    text: msg.result.unwrap_or_default(),
                    is_error: msg.is_error.unwrap_or(false),
                    subtype: msg.subtype,
                    usage: TokenUsage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cache_creation_tokens: usage.cache_creation_input_tokens,
                        cache_read_tokens: usage.cache_read_input_tokens,
                        cost_usd: msg.total_cost_usd,
                    },
                    num_turns: msg.num_turns,
                }));
            }
            _ => {}
        }
        out
    }

    fn stream_event(&mut self, event: ClaudeStreamEvent, out: &mut Vec<ParsedOutput>) {
        let index = event.index.unwrap_or(-1);
        match event.event_type.as_str() {
            "content_block_start" => {
                let Some(block) = event.content_block else { return };
                match block.block_type.as_str() {
                    "thinking" => out.push(ParsedOutput::Event(StreamEvent::ThinkingStart)),
                    "tool_use" => {
                        if let (Some(id), Some(name)) = (block.id, block.name) {
                            let _ = self.block_tools.insert(index, id.clone());
                            if self.started_tools.insert(id.clone()) {
                                out.push(ParsedOutput::Event(StreamEvent::ToolStart {
                                    tool_use_id: id,
                                    tool_name: name,
                                    tool_input: block.input.unwrap_or_else(|| serde_json::json!({})),
                                }));
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let Some(delta) = event.delta else { return };
                match delta.delta_type.as_str() {
                    "thinking_delta" => {
                        if let Some(thinking) = delta.thinking {
                            out.push(ParsedOutput::Event(StreamEvent::ThinkingDelta { text: thinking }));
                        }
                    }
                    "text_delta" => {
                        if let Some(text) = delta.text {
                            self.streamed_text = true;
                            self.text.push_str(&text);
                            out.push(ParsedOutput::Event(StreamEvent::text(text)));
                        }
                    }
                    "input_json_delta" => {
                        let (Some(id), Some(partial)) = (self.block_tools.get(&index), delta.partial_json) else {
                            return;
                        };
                        self.partial_inputs
                            .entry(id.clone())
                            .or_default()
                            .push_str(&partial);
                        out.push(ParsedOutput::Event(StreamEvent::ToolUpdate {
                            tool_use_id: id.clone(),
                            partial_json: partial,
                            input: None,
                        }));
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(id) = self.block_tools.remove(&index) {
                    let raw = self.partial_inputs.remove(&id).unwrap_or_default();
                    let input = if raw.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
                    };
                    out.push(ParsedOutput::Event(StreamEvent::ToolUpdate {
                        tool_use_id: id,
                        partial_json: String::new(),
                        input: Some(input),
                    }));
                }
            }
            _ => {}
        }
    }
}

fn clear_ansi(text: &str) -> String {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    match RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").ok()) {
        Some(re) => re.replace_all(text, "").to_string(),
        None => text.to_string(),
    }
}

// ─── Backend ────────────────────────────────────────────────────────────

pub struct ClaudeCodeBackend {
    settings: ClaudeSettings,
}

impl ClaudeCodeBackend {
    pub fn new(settings: ClaudeSettings) -> Self {
        Self { settings }
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.settings.command);
        cmd.arg("-p");
        cmd.args(["--output-format", "stream-json"]);
        cmd.args(["--input-format", "stream-json"]);
        cmd.arg("--include-partial-messages");
        cmd.arg("--verbose");

        let permission_mode = self
            .settings
            .permission_mode
            .as_deref()
            .unwrap_or("bypassPermissions");
        if permission_mode == "bypassPermissions" {
            cmd.arg("--dangerously-skip-permissions");
        } else {
            cmd.args(["--permission-mode", permission_mode]);
        }
        if request.max_turns > 0 {
            cmd.args(["--max-turns", request.max_turns.to_string().as_str()]);
        }
        if let Some(model) = &self.settings.model {
            cmd.args(["--model", model.as_str()]);
        }
        cmd.args(&self.settings.extra_args);

        cmd.current_dir(&self.settings.cwd);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

async fn write_line(stdin: &mut ChildStdin, value: &serde_json::Value) -> Result<(), EngineError> {
    let msg = format!("{}\n", value);
    stdin
        .write_all(msg.as_bytes())
        .await
        .map_err(|e| EngineError::AgentExecution(format!("Failed to write to stdin: {}", e)))?;
    stdin
        .flush()
        .await
        .map_err(|e| EngineError::AgentExecution(format!("Failed to flush stdin: {}", e)))
}

fn user_message(content: serde_json::Value, session_id: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": [content] },
        "session_id": session_id
    })
}

#[async_trait]
impl AgentBackend for ClaudeCodeBackend {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn execute(
        &self,
        request: AgentRequest,
        sink: EventSink,
    ) -> Result<AgentOutcome, EngineError> {
        let label = format!("{}#{}", request.workflow_id, request.step_number);
        tracing::info!(
            "[ClaudeCode:{}] Spawning: {} -p --output-format stream-json ... (cwd: {})",
            label,
            self.settings.command,
            self.settings.cwd
        );

        let mut child = self.command(&request).spawn().map_err(|e| {
            EngineError::AgentExecution(format!(
                "Failed to spawn Claude Code - is '{}' installed? Error: {}",
                self.settings.command, e
            ))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::AgentExecution("Failed to get stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::AgentExecution("Failed to get stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::warn!("[ClaudeCode:{} stderr] {}", label, line);
                    }
                }
            });
        }

        let prompt = serde_json::json!({ "type": "text", "text": request.prompt });
        write_line(&mut stdin, &user_message(prompt, None)).await?;

        let cancel = sink.cancellation();
        let mut parser = ClaudeStreamParser::new(&request.clarification_tool);
        let mut lines = BufReader::new(stdout).lines();
        let mut finished = None;

        while finished.is_none() {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return Err(EngineError::Cancelled("Claude Code run cancelled".into()));
                }
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    return Err(EngineError::AgentExecution(format!(
                        "Failed to read Claude Code output: {}",
                        e
                    )))
                }
            };
            for output in parser.feed(&line) {
                match output {
                    ParsedOutput::Event(event) => sink.emit(event),
                    ParsedOutput::AwaitTool { tool_use_id } => {
                        let answer = sink.await_tool_result(&tool_use_id).await?;
                        sink.emit(StreamEvent::ToolStop {
                            tool_use_id: tool_use_id.clone(),
                            result: answer.clone(),
                            is_error: false,
                        });
                        let content = serde_json::json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": answer.to_string(),
                        });
                        write_line(&mut stdin, &user_message(content, parser.session_id())).await?;
                    }
                    ParsedOutput::Finished(result) => finished = Some(result),
                }
            }
        }

        // EOF on stdin ends the session.
        drop(stdin);
        if tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .is_err()
        {
            tracing::warn!("[ClaudeCode:{}] process did not exit; killing", label);
            let _ = child.start_kill();
        }

        let Some(result) = finished else {
            return Err(EngineError::AgentExecution(
                "Claude Code exited without a result".into(),
            ));
        };
        if result.subtype.as_deref() == Some("error_max_turns") {
            return Err(EngineError::AgentExecution(format!(
                "Agent exceeded the maximum of {} turns",
                request.max_turns
            )));
        }
        if result.is_error || result.subtype.as_deref().is_some_and(|s| s.starts_with("error")) {
            let detail = if result.text.is_empty() {
                result.subtype.unwrap_or_else(|| "unknown error".into())
            } else {
                result.text
            };
            return Err(EngineError::AgentExecution(format!("Claude Code failed: {}", detail)));
        }

        tracing::info!("[ClaudeCode:{}] finished", label);
        let output_text = if result.text.is_empty() {
            parser.text().to_string()
        } else {
            result.text
        };
        Ok(AgentOutcome {
            output_text,
            output_structured: None,
            usage: result.usage,
            turns: result.num_turns.unwrap_or_else(|| parser.turns()),
        })
    }
}
