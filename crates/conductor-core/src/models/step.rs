use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Clarification,
    Refinement,
    Discovery,
    Planning,
    Routing,
    Implementation,
    QualityGate,
    GeminiReview,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarification => "clarification",
            Self::Refinement => "refinement",
            Self::Discovery => "discovery",
            Self::Planning => "planning",
            Self::Routing => "routing",
            Self::Implementation => "implementation",
            Self::QualityGate => "quality_gate",
            Self::GeminiReview => "gemini_review",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "clarification" => Some(Self::Clarification),
            "refinement" => Some(Self::Refinement),
            "discovery" => Some(Self::Discovery),
            "planning" => Some(Self::Planning),
            "routing" => Some(Self::Routing),
            "implementation" => Some(Self::Implementation),
            "quality_gate" => Some(Self::QualityGate),
            "gemini_review" => Some(Self::GeminiReview),
            _ => None,
        }
    }

    /// Gate steps are where `gates_only` workflows stop.
    pub fn is_gate(&self) -> bool {
        matches!(self, Self::QualityGate | Self::Clarification)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Clarification => "Clarify Requirements",
            Self::Refinement => "Refine Request",
            Self::Discovery => "Discover Files",
            Self::Planning => "Plan Implementation",
            Self::Routing => "Route Work",
            Self::Implementation => "Implement",
            Self::QualityGate => "Quality Gate",
            Self::GeminiReview => "Gemini Review",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Paused,
    Editing,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Editing => "editing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "editing" => Some(Self::Editing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Completed and skipped steps let the workflow advance.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// The complete set of legal step edges.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Completed, Editing)
                | (Editing, Completed)
                | (Failed, Pending)
                | (Pending, Skipped)
                | (Paused, Skipped)
                | (Paused, Failed)
        )
    }
}

/// One stage of a workflow, executed by exactly one agent run at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub workflow_id: String,
    /// 1-based, unique within the workflow.
    pub step_number: u32,
    pub step_type: StepType,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_structured: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_output_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_edited_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn new(id: String, workflow_id: String, step_number: u32, step_type: StepType) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_id,
            step_number,
            step_type,
            status: StepStatus::Pending,
            input_text: None,
            output_text: None,
            output_structured: None,
            original_output_text: None,
            output_edited_at: None,
            retry_count: 0,
            error_message: None,
            duration_ms: None,
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_type_strings() {
        for ty in [
            StepType::Clarification,
            StepType::Refinement,
            StepType::Discovery,
            StepType::Planning,
            StepType::Routing,
            StepType::Implementation,
            StepType::QualityGate,
            StepType::GeminiReview,
        ] {
            assert_eq!(StepType::from_str(ty.as_str()), Some(ty));
        }
        assert_eq!(
            serde_json::to_value(StepType::QualityGate).unwrap(),
            serde_json::json!("quality_gate")
        );
    }

    #[test]
    fn test_transition_table() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Failed.can_transition_to(StepStatus::Pending));
        assert!(StepStatus::Paused.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Running.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Skipped.can_transition_to(StepStatus::Pending));
    }

    #[test]
    fn test_new_step_is_pending() {
        let step = Step::new("s1".into(), "wf".into(), 1, StepType::Discovery);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retry_count, 0);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["stepNumber"], 1);
        assert_eq!(json["stepType"], "discovery");
        assert!(json.get("outputText").is_none());
    }
}
