use rusqlite::{Connection, OptionalExtension};

use super::to_dt;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{PauseBehavior, StepType, Workflow, WorkflowStatus, WorkflowType};

const COLUMNS: &str = "id, feature_name, feature_request, type, pause_behavior, status, step_types, \
     current_step_number, total_steps, parent_workflow_id, error_message, started_at, completed_at, \
     created_at, updated_at";

#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, workflow: &Workflow) -> Result<(), EngineError> {
        let wf = workflow.clone();
        self.db
            .with_conn_async(move |conn| upsert_workflow(conn, &wf))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM workflows WHERE id = ?1", COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_workflow(row)),
                )
                .optional()
            })
            .await
    }

    /// Newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let rows = match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM workflows WHERE status = ?1 ORDER BY created_at DESC",
                            COLUMNS
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![status.as_str()], |row| {
                                Ok(row_to_workflow(row))
                            })?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM workflows ORDER BY created_at DESC",
                            COLUMNS
                        ))?;
                        let rows = stmt
                            .query_map([], |row| Ok(row_to_workflow(row)))?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }
}

pub(crate) fn upsert_workflow(conn: &Connection, wf: &Workflow) -> Result<(), rusqlite::Error> {
    let step_types: Vec<&str> = wf.step_types.iter().map(|t| t.as_str()).collect();
    conn.execute(
        "INSERT INTO workflows (id, feature_name, feature_request, type, pause_behavior, status, step_types,
             current_step_number, total_steps, parent_workflow_id, error_message, started_at, completed_at,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
           feature_name = excluded.feature_name,
           feature_request = excluded.feature_request,
           pause_behavior = excluded.pause_behavior,
           status = excluded.status,
           step_types = excluded.step_types,
           current_step_number = excluded.current_step_number,
           total_steps = excluded.total_steps,
           error_message = excluded.error_message,
           started_at = excluded.started_at,
           completed_at = excluded.completed_at,
           updated_at = excluded.updated_at",
        rusqlite::params![
            wf.id,
            wf.feature_name,
            wf.feature_request,
            wf.workflow_type.as_str(),
            wf.pause_behavior.as_str(),
            wf.status.as_str(),
            serde_json::to_string(&step_types).unwrap_or_else(|_| "[]".to_string()),
            wf.current_step_number,
            wf.total_steps,
            wf.parent_workflow_id,
            wf.error_message,
            wf.started_at.map(|t| t.timestamp_millis()),
            wf.completed_at.map(|t| t.timestamp_millis()),
            wf.created_at.timestamp_millis(),
            wf.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn row_to_workflow(row: &rusqlite::Row<'_>) -> Workflow {
    let step_types: Vec<String> = row
        .get::<_, String>(6)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Workflow {
        id: row.get(0).unwrap_or_default(),
        feature_name: row.get(1).unwrap_or_default(),
        feature_request: row.get(2).unwrap_or_default(),
        workflow_type: row
            .get::<_, String>(3)
            .ok()
            .and_then(|s| WorkflowType::from_str(&s))
            .unwrap_or(WorkflowType::Planning),
        pause_behavior: row
            .get::<_, String>(4)
            .ok()
            .and_then(|s| PauseBehavior::from_str(&s))
            .unwrap_or_default(),
        status: row
            .get::<_, String>(5)
            .ok()
            .and_then(|s| WorkflowStatus::from_str(&s))
            .unwrap_or(WorkflowStatus::Created),
        step_types: step_types
            .iter()
            .filter_map(|s| StepType::from_str(s))
            .collect(),
        current_step_number: row.get(7).unwrap_or(0),
        total_steps: row.get(8).unwrap_or(0),
        parent_workflow_id: row.get(9).unwrap_or(None),
        error_message: row.get(10).unwrap_or(None),
        started_at: to_dt(row.get(11).unwrap_or(None)),
        completed_at: to_dt(row.get(12).unwrap_or(None)),
        created_at: to_dt(row.get(13).ok()).unwrap_or_else(chrono::Utc::now),
        updated_at: to_dt(row.get(14).ok()).unwrap_or_else(chrono::Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateWorkflowInput;

    fn workflow(name: &str) -> Workflow {
        Workflow::new(
            uuid::Uuid::new_v4().to_string(),
            CreateWorkflowInput {
                feature_name: name.to_string(),
                feature_request: format!("Build {}", name),
                workflow_type: WorkflowType::Implementation,
                pause_behavior: PauseBehavior::GatesOnly,
                step_types: None,
                parent_workflow_id: Some("parent".into()),
            },
            vec![StepType::Planning, StepType::Implementation, StepType::QualityGate],
        )
    }

    #[tokio::test]
    async fn test_save_and_get_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let store = WorkflowStore::new(db);
        let mut wf = workflow("search");
        store.save(&wf).await.unwrap();

        wf.transition(WorkflowStatus::Running).unwrap();
        wf.current_step_number = 2;
        store.save(&wf).await.unwrap();

        let loaded = store.get(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Running);
        assert_eq!(loaded.current_step_number, 2);
        assert_eq!(loaded.step_types, wf.step_types);
        assert_eq!(loaded.pause_behavior, PauseBehavior::GatesOnly);
        assert_eq!(loaded.parent_workflow_id.as_deref(), Some("parent"));
        assert_eq!(
            loaded.started_at.map(|t| t.timestamp_millis()),
            wf.started_at.map(|t| t.timestamp_millis())
        );
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let db = Database::open_in_memory().unwrap();
        let store = WorkflowStore::new(db);
        let a = workflow("a");
        let mut b = workflow("b");
        b.transition(WorkflowStatus::Running).unwrap();
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let running = store.list(Some(WorkflowStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);
    }
}
