//! CLI command implementations.
//!
//! Each submodule corresponds to a group of CLI commands and drives the
//! conductor-core engine through a [`WorkflowController`].

pub mod follow;
pub mod step;
pub mod workflow;

use std::sync::Arc;

use conductor_core::agent::scripted::sample_clarification_input;
use conductor_core::agent::{AgentBackend, ClaudeCodeBackend, Script, ScriptAction, ScriptedBackend};
use conductor_core::models::{PauseBehavior, StepType, WorkflowStatus, WorkflowType};
use conductor_core::{Database, EngineConfig, SqlitePersistence, WorkflowController};

/// Options shared by every command that builds a controller.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub db_path: String,
    pub config_path: Option<String>,
    /// Use the scripted backend instead of spawning `claude`.
    pub dry_run: bool,
}

/// Open the database and build a controller from CLI options.
pub fn init_controller(options: &EngineOptions) -> Result<WorkflowController, String> {
    let db = Database::open(&options.db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", options.db_path, e))?;
    let config = match &options.config_path {
        Some(path) => EngineConfig::from_file(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    Ok(controller_for(db, config, options.dry_run))
}

/// Build a controller over an already-open database.
pub fn controller_for(db: Database, config: EngineConfig, dry_run: bool) -> WorkflowController {
    let backend: Arc<dyn AgentBackend> = if dry_run {
        Arc::new(dry_run_backend())
    } else {
        Arc::new(ClaudeCodeBackend::new(config.claude.clone()))
    };
    tracing::debug!("[cli] using {} backend", backend.name());
    WorkflowController::new(Arc::new(SqlitePersistence::new(db)), backend, config)
}

/// Scripted backend used by `--dry-run`: every step completes with a short
/// summary, and clarification steps ask the sample questions first.
pub fn dry_run_backend() -> ScriptedBackend {
    ScriptedBackend::new()
        .script(
            StepType::Clarification,
            Script::new(vec![
                ScriptAction::Thinking(vec!["Checking the request for gaps...".into()]),
                ScriptAction::Clarify {
                    input: sample_clarification_input(),
                },
                ScriptAction::Text("Requirements captured.".into()),
            ]),
        )
        .script(
            StepType::Discovery,
            Script::new(vec![
                ScriptAction::Tool {
                    name: "Glob".into(),
                    input: serde_json::json!({"pattern": "src/**/*.rs"}),
                    result: serde_json::json!(["src/main.rs", "src/lib.rs"]),
                },
                ScriptAction::Text("Relevant files: src/main.rs, src/lib.rs".into()),
            ]),
        )
}

pub fn parse_workflow_type(s: &str) -> Result<WorkflowType, String> {
    WorkflowType::from_str(s)
        .ok_or_else(|| format!("Invalid workflow type: {}. Use planning or implementation", s))
}

pub fn parse_pause_behavior(s: &str) -> Result<PauseBehavior, String> {
    PauseBehavior::from_str(s).ok_or_else(|| {
        format!(
            "Invalid pause behavior: {}. Use continuous, auto_pause, or gates_only",
            s
        )
    })
}

pub fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, String> {
    WorkflowStatus::from_str(s).ok_or_else(|| format!("Invalid workflow status: {}", s))
}

/// Comma-separated step types, e.g. `discovery,planning`.
pub fn parse_step_types(s: &str) -> Result<Vec<StepType>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| StepType::from_str(t).ok_or_else(|| format!("Invalid step type: {}", t)))
        .collect()
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Serialize and pretty-print any value.
pub fn print_serialized<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_value(value).map_err(|e| e.to_string())?;
    print_json(&json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step_types() {
        assert_eq!(
            parse_step_types("discovery, planning,quality_gate").unwrap(),
            vec![StepType::Discovery, StepType::Planning, StepType::QualityGate]
        );
        assert!(parse_step_types("discovery,nope").is_err());
        assert!(parse_step_types("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!(parse_pause_behavior("gates_only").unwrap(), PauseBehavior::GatesOnly);
        assert!(parse_pause_behavior("sometimes").is_err());
        assert_eq!(parse_workflow_type("implementation").unwrap(), WorkflowType::Implementation);
        assert_eq!(parse_workflow_status("paused").unwrap(), WorkflowStatus::Paused);
    }
}
