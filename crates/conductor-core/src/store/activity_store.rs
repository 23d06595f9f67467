use super::to_dt;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::ActivityEntry;

#[derive(Clone)]
pub struct ActivityStore {
    db: Database,
}

impl ActivityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(&self, entry: &ActivityEntry) -> Result<(), EngineError> {
        let e = entry.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO activity_log (id, workflow_id, step_id, event_type, tool_use_id, payload, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        e.id,
                        e.workflow_id,
                        e.step_id,
                        e.event_type,
                        e.tool_use_id,
                        e.payload.to_string(),
                        e.timestamp.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Entries for a step in the order they were recorded.
    pub async fn list_by_step(&self, step_id: &str) -> Result<Vec<ActivityEntry>, EngineError> {
        let step_id = step_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, step_id, event_type, tool_use_id, payload, timestamp
                     FROM activity_log WHERE step_id = ?1 ORDER BY timestamp ASC, rowid ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![step_id], |row| Ok(row_to_entry(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn count_by_workflow(&self, workflow_id: &str) -> Result<u64, EngineError> {
        let wf_id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM activity_log WHERE workflow_id = ?1",
                    rusqlite::params![wf_id],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await
            .map(|n| n.max(0) as u64)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> ActivityEntry {
    ActivityEntry {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        step_id: row.get(2).unwrap_or_default(),
        event_type: row.get(3).unwrap_or_default(),
        tool_use_id: row.get(4).unwrap_or(None),
        payload: row
            .get::<_, String>(5)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        timestamp: to_dt(row.get(6).ok()).unwrap_or_else(chrono::Utc::now),
    }
}
