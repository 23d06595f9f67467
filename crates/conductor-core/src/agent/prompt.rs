//! Per-step-type prompt assembly.

use crate::models::{Step, StepStatus, StepType, Workflow};

fn instructions(step_type: StepType, clarification_tool: &str) -> String {
    match step_type {
        StepType::Clarification => format!(
            "Review the feature request for ambiguity. If anything important is unclear, \
             call the {} tool once with an `assessment` and a list of `questions` \
             (each with `header`, `question`, `options` and `multiSelect`). \
             Then summarise the clarified requirements.",
            clarification_tool
        ),
        StepType::Refinement => "Rewrite the feature request as a precise, testable specification \
             with acceptance criteria."
            .to_string(),
        StepType::Discovery => "Explore the repository and list the files relevant to this feature. \
             End with a ```json block of the form {\"files\": [{\"path\": ..., \"reason\": ...}]}."
            .to_string(),
        StepType::Planning => "Produce a step-by-step implementation plan. \
             End with a ```json block of the form {\"tasks\": [{\"title\": ..., \"files\": [...]}]}."
            .to_string(),
        StepType::Routing => "Split the plan into independent work units and decide the order in \
             which they should be implemented."
            .to_string(),
        StepType::Implementation => "Implement the plan. Keep changes minimal and focused, and \
             summarise what was changed."
            .to_string(),
        StepType::QualityGate => "Verify the implementation: build, run the tests, and review the \
             diff. End with a ```json block {\"passed\": bool, \"issues\": [...]}."
            .to_string(),
        StepType::GeminiReview => "Review the changes as an independent reviewer and list any \
             defects or risks."
            .to_string(),
    }
}

/// Build the prompt for `step_type` from the feature request and the
/// output of every earlier step.
pub fn build_prompt(
    workflow: &Workflow,
    step_type: StepType,
    prior_steps: &[Step],
    clarification_tool: &str,
) -> String {
    let mut prompt = format!(
        "# {}\n\nFeature: {}\n\n## Request\n{}\n",
        step_type.display_name(),
        workflow.feature_name,
        workflow.feature_request.trim()
    );

    let mut context = String::new();
    for step in prior_steps {
        match step.status {
            StepStatus::Completed => {
                let output = step.output_text.as_deref().unwrap_or("").trim();
                context.push_str(&format!(
                    "\n### Step {}: {}\n{}\n",
                    step.step_number,
                    step.step_type.display_name(),
                    output
                ));
                if step.step_type == StepType::Clarification {
                    if let Some(answers) = step
                        .output_structured
                        .as_ref()
                        .and_then(|v| v.get("answers"))
                    {
                        context.push_str(&format!("Answers: {}\n", answers));
                    }
                }
            }
            StepStatus::Skipped => context.push_str(&format!(
                "\n### Step {}: {}\n(skipped)\n",
                step.step_number,
                step.step_type.display_name()
            )),
            _ => {}
        }
    }
    if !context.is_empty() {
        prompt.push_str("\n## Previous steps\n");
        prompt.push_str(&context);
    }

    prompt.push_str("\n## Your task\n");
    prompt.push_str(&instructions(step_type, clarification_tool));
    prompt.push('\n');
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateWorkflowInput, PauseBehavior, WorkflowType};
    use crate::step::machine;
    use serde_json::json;

    fn workflow() -> Workflow {
        Workflow::new(
            "wf".into(),
            CreateWorkflowInput {
                feature_name: "oauth".into(),
                feature_request: "Add OAuth login".into(),
                workflow_type: WorkflowType::Planning,
                pause_behavior: PauseBehavior::AutoPause,
                step_types: None,
                parent_workflow_id: None,
            },
            vec![StepType::Clarification, StepType::Refinement, StepType::Planning],
        )
    }

    #[test]
    fn test_prompt_includes_prior_outputs_and_skips() {
        let mut clarify = Step::new("s1".into(), "wf".into(), 1, StepType::Clarification);
        machine::start(&mut clarify, None).unwrap();
        machine::complete(
            &mut clarify,
            "Requirements are clear".into(),
            Some(json!({"answers": {"Providers": "GitHub"}})),
        )
        .unwrap();
        let mut refine = Step::new("s2".into(), "wf".into(), 2, StepType::Refinement);
        machine::skip(&mut refine).unwrap();

        let prompt = build_prompt(
            &workflow(),
            StepType::Planning,
            &[clarify, refine],
            "AskUserQuestion",
        );
        assert!(prompt.starts_with("# Plan Implementation"));
        assert!(prompt.contains("Add OAuth login"));
        assert!(prompt.contains("Requirements are clear"));
        assert!(prompt.contains("GitHub"));
        assert!(prompt.contains("### Step 2: Refine Request\n(skipped)"));
    }

    #[test]
    fn test_clarification_prompt_names_tool() {
        let prompt = build_prompt(&workflow(), StepType::Clarification, &[], "AskUserQuestion");
        assert!(prompt.contains("call the AskUserQuestion tool"));
        assert!(!prompt.contains("Previous steps"));
    }
}
