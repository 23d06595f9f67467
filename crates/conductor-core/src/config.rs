//! Engine configuration, loadable from YAML.
//!
//! ```yaml
//! channel_capacity: 256
//! cancel_grace_ms: 5000
//! max_turns: 40
//! clarification_tool: AskUserQuestion
//! max_auto_retries: 1
//! step_templates:
//!   planning: [clarification, refinement, discovery, planning]
//! claude:
//!   command: claude
//!   cwd: "${PROJECT_DIR:-.}"
//!   model: sonnet
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{StepType, WorkflowType};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-observer buffer before the oldest droppable events are discarded.
    pub channel_capacity: usize,
    pub cancel_grace_ms: u64,
    pub max_turns: u32,
    pub clarification_tool: String,
    /// Automatic retries of a failed step before the workflow fails.
    pub max_auto_retries: u32,
    pub step_templates: HashMap<WorkflowType, Vec<StepType>>,
    pub claude: ClaudeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClaudeSettings {
    pub command: String,
    pub cwd: String,
    pub model: Option<String>,
    /// "acceptEdits" | "bypassPermissions" | any other `--permission-mode`
    pub permission_mode: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for ClaudeSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            cwd: ".".to_string(),
            model: None,
            permission_mode: Some("bypassPermissions".to_string()),
            extra_args: Vec::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            cancel_grace_ms: 5000,
            max_turns: 40,
            clarification_tool: "AskUserQuestion".to_string(),
            max_auto_retries: 0,
            step_templates: default_templates(),
            claude: ClaudeSettings::default(),
        }
    }
}

fn default_templates() -> HashMap<WorkflowType, Vec<StepType>> {
    let planning = vec![
        StepType::Clarification,
        StepType::Refinement,
        StepType::Discovery,
        StepType::Planning,
    ];
    let mut implementation = planning.clone();
    implementation.extend([
        StepType::Routing,
        StepType::Implementation,
        StepType::QualityGate,
    ]);
    HashMap::from([
        (WorkflowType::Planning, planning),
        (WorkflowType::Implementation, implementation),
    ])
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let resolved = resolve_env_vars(yaml);
        let mut config: Self = serde_yaml::from_str(&resolved)
            .map_err(|e| EngineError::Config(format!("Failed to parse config YAML: {}", e)))?;
        // Templates given in the file replace the defaults per type only.
        for (ty, steps) in default_templates() {
            config.step_templates.entry(ty).or_insert(steps);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read {}: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.channel_capacity == 0 {
            return Err(EngineError::Config("channel_capacity must be at least 1".into()));
        }
        if self.clarification_tool.trim().is_empty() {
            return Err(EngineError::Config("clarification_tool must not be empty".into()));
        }
        for (ty, steps) in &self.step_templates {
            if steps.is_empty() {
                return Err(EngineError::Config(format!(
                    "step template for '{}' is empty",
                    ty.as_str()
                )));
            }
        }
        Ok(())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// The step sequence for a new workflow: `explicit` when given, the
    /// template for `workflow_type` otherwise.
    pub fn step_sequence(
        &self,
        workflow_type: WorkflowType,
        explicit: Option<Vec<StepType>>,
    ) -> Result<Vec<StepType>, EngineError> {
        let steps = match explicit {
            Some(steps) => steps,
            None => self
                .step_templates
                .get(&workflow_type)
                .cloned()
                .unwrap_or_default(),
        };
        if steps.is_empty() {
            return Err(EngineError::Config(format!(
                "workflow of type '{}' has no steps",
                workflow_type.as_str()
            )));
        }
        Ok(steps)
    }
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax.
pub fn resolve_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_expr = &caps[1];
        if let Some(idx) = var_expr.find(":-") {
            let var_name = &var_expr[..idx];
            let default_val = &var_expr[idx + 2..];
            std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
        } else {
            std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.cancel_grace(), Duration::from_secs(5));
        assert_eq!(
            config.step_sequence(WorkflowType::Implementation, None).unwrap().last(),
            Some(&StepType::QualityGate)
        );
        assert_eq!(config.step_templates[&WorkflowType::Planning].len(), 4);
    }

    #[test]
    fn test_yaml_overrides_and_env_expansion() {
        std::env::set_var("CONDUCTOR_TEST_MODEL", "opus");
        let yaml = r#"
max_turns: 12
max_auto_retries: 2
step_templates:
  planning: [discovery, planning]
claude:
  model: "${CONDUCTOR_TEST_MODEL}"
  cwd: "${CONDUCTOR_TEST_MISSING:-/tmp}"
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        std::env::remove_var("CONDUCTOR_TEST_MODEL");
        assert_eq!(config.max_turns, 12);
        assert_eq!(config.max_auto_retries, 2);
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.claude.model.as_deref(), Some("opus"));
        assert_eq!(config.claude.cwd, "/tmp");
        assert_eq!(config.claude.command, "claude");
        assert_eq!(
            config.step_templates[&WorkflowType::Planning],
            vec![StepType::Discovery, StepType::Planning]
        );
        // Untouched template keeps its default.
        assert_eq!(config.step_templates[&WorkflowType::Implementation].len(), 7);
    }

    #[test]
    fn test_empty_sequences_are_rejected() {
        let config = EngineConfig::default();
        assert!(matches!(
            config.step_sequence(WorkflowType::Planning, Some(vec![])),
            Err(EngineError::Config(_))
        ));
        assert!(EngineConfig::from_yaml("step_templates:\n  planning: []\n").is_err());
        assert!(EngineConfig::from_yaml("channel_capacity: 0\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.yaml");
        std::fs::write(&path, "clarification_tool: AskHuman\n").unwrap();
        let config = EngineConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.clarification_tool, "AskHuman");
        assert!(EngineConfig::from_file("/nonexistent/conductor.yaml").is_err());
    }
}
