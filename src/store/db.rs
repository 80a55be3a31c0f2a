//! SQLite-backed persistence: connection handle and schema setup.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use crate::error::DatabaseError;

/// Serialized access to the engine's SQLite file.
///
/// A single `rusqlite::Connection` sits behind a `Mutex` because the
/// connection type is not `Sync`. Every store operation is one short
/// statement or transaction, so serializing them costs little even with
/// five chunk workers reporting outcomes at once.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database file, creating it (and any missing parent
    /// directories) on first run, and bring the schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();

        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    DatabaseError::Open(format!("creating {}: {e}", dir.display()))
                })?;
            }
            _ => {}
        }

        let conn = Connection::open(path)
            .map_err(|e| DatabaseError::Open(format!("{}: {e}", path.display())))?;
        let db = Self::from_connection(conn)?;
        info!(path = %path.display(), "SQLite store ready");
        Ok(db)
    }

    /// An in-memory database with the full schema, for tests.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::from_connection(
            Connection::open_in_memory()
                .map_err(|e| DatabaseError::Open(e.to_string()))?,
        )
    }

    fn from_connection(conn: Connection) -> Result<Self, DatabaseError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.apply_schema()?;
        Ok(db)
    }

    /// Lock the connection for one statement or transaction. Store methods
    /// hold the guard only for the duration of their own query.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("database lock poisoned")
    }

    /// Create any table or index that does not exist yet and turn on
    /// foreign-key enforcement for the `chat -> job -> chunk` cascade.
    /// Safe to run against an already-populated file.
    fn apply_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.lock();
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                title TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                summary TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                total_chunks INTEGER NOT NULL,
                completed_chunks INTEGER NOT NULL DEFAULT 0,
                instruction TEXT NOT NULL,
                model_id TEXT NOT NULL,
                enable_stitch_pass INTEGER NOT NULL DEFAULT 0,
                stitched_output TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_chat_status ON jobs(chat_id, status);

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                input_text TEXT NOT NULL,
                output_text TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                UNIQUE(job_id, chunk_index)
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_job ON chunks(job_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_job_status ON chunks(job_id, status);

            CREATE TABLE IF NOT EXISTS api_calls (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                purpose TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_calls_job ON api_calls(job_id);",
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(db: &Database) -> Vec<String> {
        let conn = db.lock();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        names
    }

    #[test]
    fn schema_lands_on_open() {
        let db = Database::open_in_memory().unwrap();
        let tables = table_names(&db);
        for expected in ["chats", "messages", "jobs", "chunks", "api_calls"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
    }

    #[test]
    fn open_builds_missing_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("state").join("engine.db");
        let _db = Database::open(&nested).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn reapplying_schema_changes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let before = table_names(&db);
        db.apply_schema().unwrap();
        assert_eq!(before, table_names(&db));
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock();
        let result = conn.execute(
            "INSERT INTO jobs (id, chat_id, status, total_chunks, instruction,
                model_id, created_at, updated_at)
             VALUES ('j1', 'no-such-chat', 'processing', 1, 'x', 'm', '2026', '2026')",
            [],
        );
        assert!(result.is_err(), "job row without a chat must be rejected");
    }
}
