use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::StepType;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Planning,
    Implementation,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Implementation => "implementation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(Self::Planning),
            "implementation" => Some(Self::Implementation),
            _ => None,
        }
    }
}

/// When the controller stops between steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PauseBehavior {
    /// Run every step back to back.
    Continuous,
    /// Stop after every step.
    #[default]
    AutoPause,
    /// Stop only after quality gates and clarification.
    GatesOnly,
}

impl PauseBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::AutoPause => "auto_pause",
            Self::GatesOnly => "gates_only",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "continuous" => Some(Self::Continuous),
            "auto_pause" => Some(Self::AutoPause),
            "gates_only" => Some(Self::GatesOnly),
            _ => None,
        }
    }

    /// Whether the workflow should stop after a step of `step_type` finishes.
    pub fn pauses_after(&self, step_type: StepType) -> bool {
        match self {
            Self::Continuous => false,
            Self::AutoPause => true,
            Self::GatesOnly => step_type.is_gate(),
        }
    }

    /// Whether a clarification tool call should suspend the step for a human.
    /// Continuous workflows never block on a person.
    pub fn waits_for_clarification(&self) -> bool {
        !matches!(self, Self::Continuous)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Paused,
    Editing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Editing => "editing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "editing" => Some(Self::Editing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lifecycle edges. `failed -> running` is not listed here; it is only
    /// reachable through [`Workflow::reopen_for_retry`].
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Editing)
                | (Paused, Completed)
                | (Paused, Failed)
                | (Paused, Cancelled)
                | (Editing, Paused)
                | (Editing, Cancelled)
        )
    }
}

/// One user-initiated unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub feature_name: String,
    pub feature_request: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub pause_behavior: PauseBehavior,
    pub status: WorkflowStatus,
    /// Ordered step plan; `total_steps == step_types.len()`.
    pub step_types: Vec<StepType>,
    /// 0 until the first step is created.
    pub current_step_number: u32,
    pub total_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a new workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowInput {
    pub feature_name: String,
    pub feature_request: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub pause_behavior: PauseBehavior,
    /// Explicit step sequence; the configured template is used when absent.
    #[serde(default)]
    pub step_types: Option<Vec<StepType>>,
    #[serde(default)]
    pub parent_workflow_id: Option<String>,
}

impl Workflow {
    pub fn new(id: String, input: CreateWorkflowInput, step_types: Vec<StepType>) -> Self {
        let now = Utc::now();
        Self {
            id,
            feature_name: input.feature_name,
            feature_request: input.feature_request,
            workflow_type: input.workflow_type,
            pause_behavior: input.pause_behavior,
            status: WorkflowStatus::Created,
            total_steps: step_types.len() as u32,
            step_types,
            current_step_number: 0,
            parent_workflow_id: input.parent_workflow_id,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a lifecycle transition, stamping timestamps along the way.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::invalid_workflow_transition(
                self.status.as_str(),
                next.as_str(),
            ));
        }
        let now = Utc::now();
        if next == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Mark the workflow failed with a message.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), EngineError> {
        self.transition(WorkflowStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Reopen a failed workflow because its failing step is being retried.
    ///
    /// `failed` is otherwise terminal: this is the one exit from it, and
    /// only `retry_step` takes it. `can_transition_to` still reports
    /// `failed -> running` as illegal.
    pub fn reopen_for_retry(&mut self) -> Result<(), EngineError> {
        if self.status != WorkflowStatus::Failed {
            return Err(EngineError::invalid_workflow_transition(
                self.status.as_str(),
                WorkflowStatus::Running.as_str(),
            ));
        }
        self.status = WorkflowStatus::Running;
        self.error_message = None;
        self.completed_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Step type planned for a 1-based step number.
    pub fn step_type_at(&self, step_number: u32) -> Option<StepType> {
        if step_number == 0 {
            return None;
        }
        self.step_types.get(step_number as usize - 1).copied()
    }

    pub fn has_more_steps(&self) -> bool {
        self.current_step_number < self.total_steps
    }
}
