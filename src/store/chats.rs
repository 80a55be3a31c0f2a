//! ChatStore — the chat-facing rows the engine reads and writes.
//!
//! Covers chats, their messages, and per-call LLM telemetry. The engine
//! appends a notice when a job starts and exactly one assistant message at
//! finalization; everything else about the chat system lives elsewhere.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::db::Database;
use super::jobs::parse_datetime;
use crate::error::DatabaseError;

/// Content longer than this gets a leading-slice summary on the message row.
const SUMMARY_THRESHOLD_CHARS: usize = 2000;

/// A persisted chat message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub role: String,
    pub content: String,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persistent chat storage backed by SQLite.
pub struct ChatStore {
    db: Arc<Database>,
}

impl ChatStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a chat. Returns the generated id.
    pub fn create_chat(&self, title: Option<&str>) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO chats (id, title, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, title, Utc::now().to_rfc3339()],
        )
        .map_err(DatabaseError::from)?;
        debug!(chat_id = %id, "Chat created");
        Ok(id)
    }

    pub fn chat_exists(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.db.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chats WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::from)?;
        Ok(count > 0)
    }

    /// Append a message to a chat. Long content gets its first 2,000 chars
    /// mirrored into `summary` for listing views.
    pub fn insert_message(
        &self,
        chat_id: &str,
        role: &str,
        content: &str,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let summary = if content.chars().count() > SUMMARY_THRESHOLD_CHARS {
            Some(content.chars().take(SUMMARY_THRESHOLD_CHARS).collect::<String>())
        } else {
            None
        };
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO messages (id, chat_id, role, content, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![id, chat_id, role, content, summary, Utc::now().to_rfc3339()],
        )
        .map_err(DatabaseError::from)?;
        debug!(chat_id = chat_id, role = role, "Message inserted");
        Ok(id)
    }

    /// List a chat's messages, oldest first.
    pub fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<StoredMessage>, DatabaseError> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, chat_id, role, content, summary, created_at
                 FROM messages WHERE chat_id = ?1 ORDER BY created_at ASC, id ASC",
            )
            .map_err(DatabaseError::from)?;
        let rows = stmt
            .query_map(rusqlite::params![chat_id], row_to_message)
            .map_err(DatabaseError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Whether an assistant message was appended to the chat at or after
    /// `since`. Guards finalization against inserting a duplicate artifact
    /// when a resumed job crashed mid-finalize.
    pub fn assistant_message_exists_since(
        &self,
        chat_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.db.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE chat_id = ?1 AND role = 'assistant' AND created_at >= ?2",
                rusqlite::params![chat_id, since.to_rfc3339()],
                |row| row.get(0),
            )
            .map_err(DatabaseError::from)?;
        Ok(count > 0)
    }

    /// Record one remote call for cost telemetry.
    pub fn record_api_call(
        &self,
        job_id: &str,
        purpose: &str,
        model: &str,
        tokens: u64,
        cost: f64,
    ) -> Result<(), DatabaseError> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO api_calls (id, job_id, purpose, model, tokens, cost, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                job_id,
                purpose,
                model,
                tokens as i64,
                cost,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, rusqlite::Error> {
    let created_at: String = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        summary: row.get(4)?,
        created_at: parse_datetime(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_store() -> (ChatStore, String) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = ChatStore::new(db);
        let chat_id = store.create_chat(Some("book translation")).unwrap();
        (store, chat_id)
    }

    #[test]
    fn create_and_check_chat() {
        let (store, chat_id) = test_store();
        assert!(store.chat_exists(&chat_id).unwrap());
        assert!(!store.chat_exists("nope").unwrap());
    }

    #[test]
    fn messages_come_back_in_order() {
        let (store, chat_id) = test_store();
        store.insert_message(&chat_id, "system", "first").unwrap();
        store.insert_message(&chat_id, "assistant", "second").unwrap();

        let messages = store.messages_for_chat(&chat_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].role, "assistant");
    }

    #[test]
    fn long_content_gets_a_summary() {
        let (store, chat_id) = test_store();
        let long = "x".repeat(5000);
        store.insert_message(&chat_id, "assistant", &long).unwrap();

        let messages = store.messages_for_chat(&chat_id).unwrap();
        let summary = messages[0].summary.as_ref().unwrap();
        assert_eq!(summary.chars().count(), 2000);
        assert_eq!(messages[0].content.chars().count(), 5000);

        store.insert_message(&chat_id, "assistant", "short").unwrap();
        let messages = store.messages_for_chat(&chat_id).unwrap();
        assert!(messages[1].summary.is_none());
    }

    #[test]
    fn assistant_message_window_check() {
        let (store, chat_id) = test_store();
        let before = Utc::now() - Duration::seconds(5);

        store.insert_message(&chat_id, "system", "job started").unwrap();
        assert!(!store
            .assistant_message_exists_since(&chat_id, before)
            .unwrap());

        store.insert_message(&chat_id, "assistant", "result").unwrap();
        assert!(store
            .assistant_message_exists_since(&chat_id, before)
            .unwrap());
        assert!(!store
            .assistant_message_exists_since(&chat_id, Utc::now() + Duration::seconds(60))
            .unwrap());
    }
}
