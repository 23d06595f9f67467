//! SQLite database layer for the workflow engine.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing and dry runs).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Run `f` inside a single transaction; nothing is written unless it
    /// returns `Ok`.
    pub async fn transaction_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn_async(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let value = f(&*tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id                  TEXT PRIMARY KEY,
                    feature_name        TEXT NOT NULL,
                    feature_request     TEXT NOT NULL,
                    type                TEXT NOT NULL,
                    pause_behavior      TEXT NOT NULL DEFAULT 'auto_pause',
                    status              TEXT NOT NULL DEFAULT 'created',
                    step_types          TEXT NOT NULL DEFAULT '[]',
                    current_step_number INTEGER NOT NULL DEFAULT 0,
                    total_steps         INTEGER NOT NULL DEFAULT 0,
                    parent_workflow_id  TEXT,
                    error_message       TEXT,
                    started_at          INTEGER,
                    completed_at        INTEGER,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    id                      TEXT PRIMARY KEY,
                    workflow_id             TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    step_number             INTEGER NOT NULL,
                    step_type               TEXT NOT NULL,
                    status                  TEXT NOT NULL DEFAULT 'pending',
                    input_text              TEXT,
                    output_text             TEXT,
                    output_structured       TEXT,
                    original_output_text    TEXT,
                    output_edited_at        INTEGER,
                    retry_count             INTEGER NOT NULL DEFAULT 0,
                    error_message           TEXT,
                    duration_ms             INTEGER,
                    input_tokens            INTEGER,
                    output_tokens           INTEGER,
                    cost_usd                REAL,
                    started_at              INTEGER,
                    completed_at            INTEGER,
                    created_at              INTEGER NOT NULL,
                    updated_at              INTEGER NOT NULL,
                    UNIQUE (workflow_id, step_number)
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_steps_status ON workflow_steps(status);

                CREATE TABLE IF NOT EXISTS activity_log (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL REFERENCES workflow_steps(id) ON DELETE CASCADE,
                    event_type      TEXT NOT NULL,
                    tool_use_id     TEXT,
                    payload         TEXT NOT NULL DEFAULT '{}',
                    timestamp       INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_activity_step_event_time
                    ON activity_log(step_id, event_type, timestamp);
                CREATE INDEX IF NOT EXISTS idx_activity_workflow ON activity_log(workflow_id);
                ",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tables_exist() {
        let db = Database::open_in_memory().unwrap();
        let names: Vec<String> = db
            .with_conn_async(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .unwrap();
        assert_eq!(names, vec!["activity_log", "workflow_steps", "workflows"]);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result = db
            .transaction_async(|conn| {
                conn.execute(
                    "INSERT INTO workflows (id, feature_name, feature_request, type, created_at, updated_at)
                     VALUES ('wf', 'n', 'r', 'planning', 0, 0)",
                    [],
                )?;
                // Violates the foreign key.
                conn.execute(
                    "INSERT INTO workflow_steps (id, workflow_id, step_number, step_type, created_at, updated_at)
                     VALUES ('s', 'missing', 1, 'planning', 0, 0)",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
        let count: i64 = db
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM workflows", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("conductor.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();
        drop(db);
        assert!(path.exists());
    }
}
