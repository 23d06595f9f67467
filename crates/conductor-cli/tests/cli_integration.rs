//! Integration tests for the conductor-cli commands.
//!
//! These tests drive the same command functions as the binary, using the
//! dry-run backend and in-memory SQLite databases for isolation.

use conductor_cli::commands::follow::ClarifyMode;
use conductor_cli::commands::workflow::RunArgs;
use conductor_cli::commands::{self, controller_for, EngineOptions};
use conductor_core::agent::scripted::sample_clarification_input;
use conductor_core::models::{CreateWorkflowInput, PauseBehavior, StepStatus, WorkflowStatus, WorkflowType};
use conductor_core::{Database, EngineConfig, WorkflowController};

fn test_controller() -> WorkflowController {
    let db = Database::open_in_memory().expect("Failed to open in-memory database");
    controller_for(db, EngineConfig::default(), true)
}

fn run_args(workflow_type: &str, pause: &str, steps: Option<&str>) -> RunArgs {
    RunArgs {
        feature_name: "dark-mode".to_string(),
        feature_request: "Add a dark mode toggle to the settings page".to_string(),
        workflow_type: workflow_type.to_string(),
        pause_behavior: pause.to_string(),
        steps: steps.map(str::to_string),
        mode: ClarifyMode::Skip,
    }
}

#[tokio::test]
async fn test_run_pauses_after_clarification_gate_then_resumes() {
    let controller = test_controller();

    let workflow = commands::workflow::run(&controller, run_args("planning", "gates_only", None))
        .await
        .expect("run should succeed");
    assert_eq!(workflow.status, WorkflowStatus::Paused);
    assert_eq!(workflow.current_step_number, 1);
    assert_eq!(workflow.total_steps, 4);

    let steps = controller.list_steps(&workflow.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    let output = steps[0].output_structured.clone().expect("structured clarification output");
    assert_eq!(output["questions"], sample_clarification_input()["questions"]);
    assert_eq!(output["skipped"], serde_json::json!(true));

    let workflow = commands::workflow::resume(&controller, &workflow.id, ClarifyMode::Skip)
        .await
        .expect("resume should succeed");
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let steps = controller.list_steps(&workflow.id).await.unwrap();
    assert_eq!(steps.len(), 4);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn test_run_continuous_completes_without_questions() {
    let controller = test_controller();

    let workflow = commands::workflow::run(&controller, run_args("implementation", "continuous", None))
        .await
        .expect("run should succeed");
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(workflow.total_steps, 7);
    assert!(controller
        .pending_clarification(&workflow.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_run_with_custom_steps() {
    let controller = test_controller();

    let workflow = commands::workflow::run(
        &controller,
        run_args("planning", "continuous", Some("discovery, planning")),
    )
    .await
    .expect("run should succeed");
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(workflow.total_steps, 2);

    let steps = controller.list_steps(&workflow.id).await.unwrap();
    let discovery = controller.list_activity(&steps[0].id).await.unwrap();
    assert!(discovery.iter().any(|e| e.tool_use_id.is_some()));
}

#[tokio::test]
async fn test_run_rejects_bad_arguments() {
    let controller = test_controller();

    let err = commands::workflow::run(&controller, run_args("planning", "continuous", Some("discovery,nope")))
        .await
        .unwrap_err();
    assert!(err.contains("Invalid step type"));

    let err = commands::workflow::run(&controller, run_args("planning", "sometimes", None))
        .await
        .unwrap_err();
    assert!(err.contains("Invalid pause behavior"));

    assert!(controller.list_workflows(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rerun_links_new_workflow() {
    let controller = test_controller();
    let first = commands::workflow::run(&controller, run_args("planning", "continuous", Some("planning")))
        .await
        .unwrap();

    let second = commands::workflow::rerun(&controller, &first.id, ClarifyMode::Skip)
        .await
        .expect("rerun should succeed");
    assert_ne!(second.id, first.id);
    assert_eq!(second.parent_workflow_id.as_deref(), Some(first.id.as_str()));
    assert_eq!(second.status, WorkflowStatus::Completed);
    assert_eq!(controller.list_workflows(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancel_created_workflow() {
    let controller = test_controller();
    let workflow = controller
        .create(CreateWorkflowInput {
            feature_name: "export".into(),
            feature_request: "Export reports as CSV".into(),
            workflow_type: WorkflowType::Planning,
            pause_behavior: PauseBehavior::AutoPause,
            step_types: None,
            parent_workflow_id: None,
        })
        .await
        .unwrap();

    commands::workflow::cancel(&controller, &workflow.id)
        .await
        .expect("cancel should succeed");
    let workflow = controller.get_workflow(&workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Cancelled);

    // Resuming a finished workflow leaves it as it is.
    let resumed = commands::workflow::resume(&controller, &workflow.id, ClarifyMode::Skip)
        .await
        .unwrap();
    assert_eq!(resumed.status, WorkflowStatus::Cancelled);
}

#[tokio::test]
async fn test_step_edit_and_inspection_commands() {
    let controller = test_controller();
    let workflow = commands::workflow::run(&controller, run_args("planning", "continuous", Some("planning")))
        .await
        .unwrap();
    let step_id = controller.list_steps(&workflow.id).await.unwrap()[0].id.clone();
    let original = controller.get_step(&step_id).await.unwrap().output_text;

    commands::step::edit(&controller, &step_id, Some("1. Add toggle".into()), None)
        .await
        .expect("edit should succeed");
    let step = controller.get_step(&step_id).await.unwrap();
    assert_eq!(step.output_text.as_deref(), Some("1. Add toggle"));
    assert_eq!(step.original_output_text, original);

    assert!(commands::step::edit(&controller, &step_id, None, None).await.is_err());
    assert!(
        commands::step::edit(&controller, &step_id, Some("a".into()), Some("b.md".into()))
            .await
            .is_err()
    );

    commands::step::activity(&controller, &step_id, true).await.unwrap();
    commands::workflow::show(&controller, &workflow.id, false).await.unwrap();
    commands::workflow::show(&controller, &workflow.id, true).await.unwrap();
    commands::workflow::list(&controller, Some("completed"), false).await.unwrap();
    assert!(commands::workflow::list(&controller, Some("bogus"), false).await.is_err());
}

#[tokio::test]
async fn test_step_edit_from_file() {
    let controller = test_controller();
    let workflow = commands::workflow::run(&controller, run_args("planning", "continuous", Some("discovery")))
        .await
        .unwrap();
    let step_id = controller.list_steps(&workflow.id).await.unwrap()[0].id.clone();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("output.md");
    std::fs::write(&path, "src/theme.rs").unwrap();

    commands::step::edit(&controller, &step_id, None, Some(path.to_string_lossy().into_owned()))
        .await
        .unwrap();
    let step = controller.get_step(&step_id).await.unwrap();
    assert_eq!(step.output_text.as_deref(), Some("src/theme.rs"));
}

#[tokio::test]
async fn test_skip_rejects_completed_step() {
    let controller = test_controller();
    let workflow = commands::workflow::run(&controller, run_args("planning", "continuous", Some("planning")))
        .await
        .unwrap();
    let step_id = controller.list_steps(&workflow.id).await.unwrap()[0].id.clone();

    assert!(commands::step::skip(&controller, &step_id).await.is_err());
}

#[tokio::test]
async fn test_init_controller_with_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("conductor.db");
    let options = EngineOptions {
        db_path: db_path.to_string_lossy().into_owned(),
        config_path: None,
        dry_run: true,
    };

    let workflow_id = {
        let controller = commands::init_controller(&options).expect("controller");
        assert_eq!(controller.backend_name(), "scripted");
        commands::workflow::run(&controller, run_args("planning", "continuous", Some("planning")))
            .await
            .unwrap()
            .id
    };

    // A second process sees the persisted workflow.
    let controller = commands::init_controller(&options).unwrap();
    let workflow = controller.get_workflow(&workflow_id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    commands::workflow::recover(&controller).await.unwrap();
}

#[tokio::test]
async fn test_init_controller_reports_bad_config() {
    let options = EngineOptions {
        db_path: ":memory:".into(),
        config_path: Some("/nonexistent/conductor.yaml".into()),
        dry_run: true,
    };
    assert!(commands::init_controller(&options).is_err());
}
