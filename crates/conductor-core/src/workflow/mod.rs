//! Workflow Controller and the workflow-level observer stream.

pub mod controller;

pub use controller::{RecoveryReport, WorkflowController};

use serde::Serialize;

use crate::models::{StepStatus, WorkflowStatus};
use crate::stream::{FanoutItem, StreamEvent};

/// What `subscribe(workflow_id)` delivers: every agent event of every step,
/// interleaved with step and workflow status changes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkflowEvent {
    Agent {
        step_id: String,
        step_number: u32,
        event: StreamEvent,
    },
    StepStatus {
        step_id: String,
        step_number: u32,
        status: StepStatus,
    },
    WorkflowStatus {
        status: WorkflowStatus,
    },
}

impl FanoutItem for WorkflowEvent {
    fn is_droppable(&self) -> bool {
        match self {
            Self::Agent { event, .. } => event.is_droppable(),
            _ => false,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowStatus { status } if status.is_terminal())
    }
}
