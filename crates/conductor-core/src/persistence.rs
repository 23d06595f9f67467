//! The narrow persistence adapter the engine depends on.
//!
//! The controller never issues queries itself; any storage engine that can
//! implement [`Persistence`] can sit behind it.

use async_trait::async_trait;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::{ActivityEntry, Step, StepStatus, Workflow, WorkflowStatus};
use crate::store::{step_store, workflow_store, ActivityStore, StepStore, WorkflowStore};

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, EngineError>;
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), EngineError>;
    async fn load_step(&self, id: &str) -> Result<Option<Step>, EngineError>;
    async fn save_step(&self, step: &Step) -> Result<(), EngineError>;
    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), EngineError>;

    /// Write a step and its workflow atomically.
    async fn commit(&self, step: &Step, workflow: &Workflow) -> Result<(), EngineError>;

    async fn list_steps(&self, workflow_id: &str) -> Result<Vec<Step>, EngineError>;
    async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, EngineError>;
    async fn list_steps_by_status(&self, status: StepStatus) -> Result<Vec<Step>, EngineError>;
    async fn list_activity(&self, step_id: &str) -> Result<Vec<ActivityEntry>, EngineError>;
}

#[derive(Clone)]
pub struct SqlitePersistence {
    db: Database,
    workflows: WorkflowStore,
    steps: StepStore,
    activity: ActivityStore,
}

impl SqlitePersistence {
    pub fn new(db: Database) -> Self {
        Self {
            workflows: WorkflowStore::new(db.clone()),
            steps: StepStore::new(db.clone()),
            activity: ActivityStore::new(db.clone()),
            db,
        }
    }

    pub fn activity_store(&self) -> &ActivityStore {
        &self.activity
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, EngineError> {
        self.workflows.get(id).await
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), EngineError> {
        self.workflows.save(workflow).await
    }

    async fn load_step(&self, id: &str) -> Result<Option<Step>, EngineError> {
        self.steps.get(id).await
    }

    async fn save_step(&self, step: &Step) -> Result<(), EngineError> {
        self.steps.save(step).await
    }

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), EngineError> {
        self.activity.append(entry).await
    }

    async fn commit(&self, step: &Step, workflow: &Workflow) -> Result<(), EngineError> {
        let step = step.clone();
        let workflow = workflow.clone();
        self.db
            .transaction_async(move |conn| {
                workflow_store::upsert_workflow(conn, &workflow)?;
                step_store::upsert_step(conn, &step)
            })
            .await
    }

    async fn list_steps(&self, workflow_id: &str) -> Result<Vec<Step>, EngineError> {
        self.steps.list_by_workflow(workflow_id).await
    }

    async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, EngineError> {
        self.workflows.list(status).await
    }

    async fn list_steps_by_status(&self, status: StepStatus) -> Result<Vec<Step>, EngineError> {
        self.steps.list_by_status(status).await
    }

    async fn list_activity(&self, step_id: &str) -> Result<Vec<ActivityEntry>, EngineError> {
        self.activity.list_by_step(step_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateWorkflowInput, PauseBehavior, StepType, WorkflowType};
    use chrono::Utc;
    use serde_json::json;

    fn workflow() -> Workflow {
        Workflow::new(
            "wf-1".into(),
            CreateWorkflowInput {
                feature_name: "f".into(),
                feature_request: "r".into(),
                workflow_type: WorkflowType::Planning,
                pause_behavior: PauseBehavior::AutoPause,
                step_types: None,
                parent_workflow_id: None,
            },
            vec![StepType::Discovery],
        )
    }

    #[tokio::test]
    async fn test_commit_writes_both_records() {
        let p = SqlitePersistence::new(Database::open_in_memory().unwrap());
        let mut wf = workflow();
        wf.transition(WorkflowStatus::Running).unwrap();
        wf.current_step_number = 1;
        let step = Step::new("s1".into(), wf.id.clone(), 1, StepType::Discovery);
        p.commit(&step, &wf).await.unwrap();

        assert_eq!(
            p.load_workflow("wf-1").await.unwrap().unwrap().current_step_number,
            1
        );
        assert!(p.load_step("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let p = SqlitePersistence::new(Database::open_in_memory().unwrap());
        let wf = workflow();
        p.save_workflow(&wf).await.unwrap();
        p.save_step(&Step::new("s1".into(), wf.id.clone(), 1, StepType::Discovery))
            .await
            .unwrap();

        // Same number, different id: the step insert fails, so the workflow
        // update must not land either.
        let mut changed = wf.clone();
        changed.transition(WorkflowStatus::Running).unwrap();
        let clash = Step::new("s2".into(), wf.id.clone(), 1, StepType::Discovery);
        assert!(p.commit(&clash, &changed).await.is_err());
        assert_eq!(
            p.load_workflow("wf-1").await.unwrap().unwrap().status,
            WorkflowStatus::Created
        );
    }

    #[tokio::test]
    async fn test_activity_is_listed_in_order() {
        let p = SqlitePersistence::new(Database::open_in_memory().unwrap());
        let wf = workflow();
        let step = Step::new("s1".into(), wf.id.clone(), 1, StepType::Discovery);
        p.commit(&step, &wf).await.unwrap();

        let now = Utc::now();
        for (i, kind) in ["phase_change", "text_delta", "tool_start"].iter().enumerate() {
            p.append_activity(&ActivityEntry {
                id: format!("a{}", i),
                workflow_id: wf.id.clone(),
                step_id: step.id.clone(),
                event_type: kind.to_string(),
                tool_use_id: (*kind == "tool_start").then(|| "toolu_1".to_string()),
                payload: json!({"type": kind}),
                timestamp: now,
            })
            .await
            .unwrap();
        }
        let entries = p.list_activity("s1").await.unwrap();
        let kinds: Vec<_> = entries.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["phase_change", "text_delta", "tool_start"]);
        assert_eq!(entries[2].tool_use_id.as_deref(), Some("toolu_1"));
        assert_eq!(p.activity_store().count_by_workflow("wf-1").await.unwrap(), 3);
    }
}
