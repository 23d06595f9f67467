use rusqlite::{Connection, OptionalExtension};

use super::to_dt;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{Step, StepStatus, StepType};

const COLUMNS: &str = "id, workflow_id, step_number, step_type, status, input_text, output_text, \
     output_structured, original_output_text, output_edited_at, retry_count, error_message, duration_ms, \
     input_tokens, output_tokens, cost_usd, started_at, completed_at, created_at, updated_at";

#[derive(Clone)]
pub struct StepStore {
    db: Database,
}

impl StepStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, step: &Step) -> Result<(), EngineError> {
        let s = step.clone();
        self.db.with_conn_async(move |conn| upsert_step(conn, &s)).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Step>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM workflow_steps WHERE id = ?1", COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_step(row)),
                )
                .optional()
            })
            .await
    }

    /// Steps of a workflow in step-number order.
    pub async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<Step>, EngineError> {
        let wf_id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_number ASC",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![wf_id], |row| Ok(row_to_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_status(&self, status: StepStatus) -> Result<Vec<Step>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_steps WHERE status = ?1 ORDER BY workflow_id, step_number",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status.as_str()], |row| Ok(row_to_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

pub(crate) fn upsert_step(conn: &Connection, s: &Step) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO workflow_steps (id, workflow_id, step_number, step_type, status, input_text, output_text,
             output_structured, original_output_text, output_edited_at, retry_count, error_message, duration_ms,
             input_tokens, output_tokens, cost_usd, started_at, completed_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
         ON CONFLICT(id) DO UPDATE SET
           status = excluded.status,
           input_text = excluded.input_text,
           output_text = excluded.output_text,
           output_structured = excluded.output_structured,
           original_output_text = excluded.original_output_text,
           output_edited_at = excluded.output_edited_at,
           retry_count = excluded.retry_count,
           error_message = excluded.error_message,
           duration_ms = excluded.duration_ms,
           input_tokens = excluded.input_tokens,
           output_tokens = excluded.output_tokens,
           cost_usd = excluded.cost_usd,
           started_at = excluded.started_at,
           completed_at = excluded.completed_at,
           updated_at = excluded.updated_at",
        rusqlite::params![
            s.id,
            s.workflow_id,
            s.step_number,
            s.step_type.as_str(),
            s.status.as_str(),
            s.input_text,
            s.output_text,
            s.output_structured.as_ref().map(|v| v.to_string()),
            s.original_output_text,
            s.output_edited_at.map(|t| t.timestamp_millis()),
            s.retry_count,
            s.error_message,
            s.duration_ms.map(|v| v as i64),
            s.input_tokens.map(|v| v as i64),
            s.output_tokens.map(|v| v as i64),
            s.cost_usd,
            s.started_at.map(|t| t.timestamp_millis()),
            s.completed_at.map(|t| t.timestamp_millis()),
            s.created_at.timestamp_millis(),
            s.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn row_to_step(row: &rusqlite::Row<'_>) -> Step {
    let as_u64 = |v: Option<i64>| v.map(|n| n.max(0) as u64);

    Step {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        step_number: row.get(2).unwrap_or(0),
        step_type: row
            .get::<_, String>(3)
            .ok()
            .and_then(|s| StepType::from_str(&s))
            .unwrap_or(StepType::Planning),
        status: row
            .get::<_, String>(4)
            .ok()
            .and_then(|s| StepStatus::from_str(&s))
            .unwrap_or(StepStatus::Pending),
        input_text: row.get(5).unwrap_or(None),
        output_text: row.get(6).unwrap_or(None),
        output_structured: row
            .get::<_, Option<String>>(7)
            .unwrap_or(None)
            .and_then(|s| serde_json::from_str(&s).ok()),
        original_output_text: row.get(8).unwrap_or(None),
        output_edited_at: to_dt(row.get(9).unwrap_or(None)),
        retry_count: row.get(10).unwrap_or(0),
        error_message: row.get(11).unwrap_or(None),
        duration_ms: as_u64(row.get(12).unwrap_or(None)),
        input_tokens: as_u64(row.get(13).unwrap_or(None)),
        output_tokens: as_u64(row.get(14).unwrap_or(None)),
        cost_usd: row.get(15).unwrap_or(None),
        started_at: to_dt(row.get(16).unwrap_or(None)),
        completed_at: to_dt(row.get(17).unwrap_or(None)),
        created_at: to_dt(row.get(18).ok()).unwrap_or_else(chrono::Utc::now),
        updated_at: to_dt(row.get(19).ok()).unwrap_or_else(chrono::Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateWorkflowInput, PauseBehavior, Workflow, WorkflowType};
    use crate::step::machine;
    use crate::store::WorkflowStore;
    use serde_json::json;

    async fn setup() -> (StepStore, String) {
        let db = Database::open_in_memory().unwrap();
        let wf = Workflow::new(
            "wf-1".into(),
            CreateWorkflowInput {
                feature_name: "f".into(),
                feature_request: "r".into(),
                workflow_type: WorkflowType::Planning,
                pause_behavior: PauseBehavior::Continuous,
                step_types: None,
                parent_workflow_id: None,
            },
            vec![StepType::Discovery, StepType::Planning],
        );
        WorkflowStore::new(db.clone()).save(&wf).await.unwrap();
        (StepStore::new(db), wf.id)
    }

    #[tokio::test]
    async fn test_step_round_trip_keeps_structured_output() {
        let (store, wf_id) = setup().await;
        let mut step = Step::new("s1".into(), wf_id.clone(), 1, StepType::Discovery);
        machine::start(&mut step, Some("prompt".into())).unwrap();
        machine::complete(&mut step, "found".into(), Some(json!({"files": ["a.rs"]}))).unwrap();
        step.input_tokens = Some(12);
        store.save(&step).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, StepStatus::Completed);
        assert_eq!(loaded.output_structured, Some(json!({"files": ["a.rs"]})));
        assert_eq!(loaded.input_tokens, Some(12));
        assert_eq!(loaded.input_text.as_deref(), Some("prompt"));
        assert_eq!(loaded.duration_ms, step.duration_ms);
    }

    #[tokio::test]
    async fn test_step_numbers_are_unique_per_workflow() {
        let (store, wf_id) = setup().await;
        store
            .save(&Step::new("s1".into(), wf_id.clone(), 1, StepType::Discovery))
            .await
            .unwrap();
        let dup = store
            .save(&Step::new("s2".into(), wf_id.clone(), 1, StepType::Planning))
            .await;
        assert!(matches!(dup, Err(EngineError::Database(_))));

        store
            .save(&Step::new("s3".into(), wf_id.clone(), 2, StepType::Planning))
            .await
            .unwrap();
        let numbers: Vec<u32> = store
            .list_by_workflow(&wf_id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.step_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(store.list_by_status(StepStatus::Pending).await.unwrap().len(), 2);
    }
}
