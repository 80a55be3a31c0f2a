//! JobStore — persistence for big-context jobs and their chunks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::db::Database;
use crate::chunker::TextChunk;
use crate::error::DatabaseError;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Stitching,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Processing) | (Pending, Cancelled) |
            (Processing, Stitching) | (Processing, Completed) |
            (Processing, Failed) | (Processing, Cancelled) |
            (Stitching, Completed) | (Stitching, Failed) | (Stitching, Cancelled) |
            // retry-failed and resume re-open a finished run
            (Failed, Processing) | (Completed, Processing)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Stitching => "stitching",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "stitching" => Self::Stitching,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ChunkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted job row.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub chat_id: String,
    pub status: JobStatus,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub instruction: String,
    pub model_id: String,
    pub enable_stitch_pass: bool,
    pub stitched_output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted chunk row.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub job_id: String,
    pub index: u32,
    pub input_text: String,
    pub output_text: Option<String>,
    pub status: ChunkStatus,
    pub error: Option<String>,
    pub tokens: u64,
    pub cost: f64,
}

/// Inputs for creating a job together with its chunk rows.
pub struct NewJob<'a> {
    pub chat_id: &'a str,
    pub instruction: &'a str,
    pub model_id: &'a str,
    pub enable_stitch_pass: bool,
    pub chunks: &'a [TextChunk],
}

/// Persistent job storage backed by SQLite.
pub struct JobStore {
    db: Arc<Database>,
}

impl JobStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a job and bulk-insert its chunk rows in one transaction.
    /// Returns the generated job id.
    pub fn insert_job(&self, new: NewJob<'_>) -> Result<String, DatabaseError> {
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(DatabaseError::from)?;

        tx.execute(
            "INSERT INTO jobs (id, chat_id, status, total_chunks, completed_chunks,
                instruction, model_id, enable_stitch_pass, created_at, updated_at)
             VALUES (?1, ?2, 'processing', ?3, 0, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                job_id,
                new.chat_id,
                new.chunks.len() as i64,
                new.instruction,
                new.model_id,
                new.enable_stitch_pass as i64,
                now,
            ],
        )
        .map_err(DatabaseError::from)?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO chunks (id, job_id, chunk_index, input_text, status)
                     VALUES (?1, ?2, ?3, ?4, 'pending')",
                )
                .map_err(DatabaseError::from)?;
            for chunk in new.chunks {
                stmt.execute(rusqlite::params![
                    Uuid::new_v4().to_string(),
                    job_id,
                    chunk.index as i64,
                    chunk.text,
                ])
                .map_err(DatabaseError::from)?;
            }
        }

        tx.commit().map_err(DatabaseError::from)?;
        debug!(job_id = %job_id, chunks = new.chunks.len(), "Job inserted");
        Ok(job_id)
    }

    /// Look up a job by id.
    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>, DatabaseError> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, chat_id, status, total_chunks, completed_chunks, instruction,
                        model_id, enable_stitch_pass, stitched_output, created_at, updated_at
                 FROM jobs WHERE id = ?1",
            )
            .map_err(DatabaseError::from)?;
        let mut rows = stmt
            .query_map(rusqlite::params![id], row_to_job)
            .map_err(DatabaseError::from)?;
        match rows.next() {
            Some(Ok(job)) => Ok(Some(job)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Like [`get_job`](Self::get_job) but not-found is an error.
    pub fn require_job(&self, id: &str) -> Result<JobRecord, DatabaseError> {
        self.get_job(id)?.ok_or_else(|| DatabaseError::NotFound {
            entity: "job".to_string(),
            id: id.to_string(),
        })
    }

    /// Update a job's status and advance `updated_at`.
    pub fn set_job_status(&self, id: &str, status: JobStatus) -> Result<(), DatabaseError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), Utc::now().to_rfc3339(), id],
        )
        .map_err(DatabaseError::from)?;
        debug!(job_id = id, status = %status, "Job status updated");
        Ok(())
    }

    /// Terminal write: status and stitched output land in one statement so a
    /// reader can never observe `completed` with a missing output.
    pub fn finalize_job(
        &self,
        id: &str,
        status: JobStatus,
        stitched_output: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE jobs SET status = ?1, stitched_output = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![status.as_str(), stitched_output, Utc::now().to_rfc3339(), id],
        )
        .map_err(DatabaseError::from)?;
        debug!(job_id = id, status = %status, "Job finalized");
        Ok(())
    }

    /// Server-side increment of the progress counter. Safe under concurrent
    /// chunk completions; never read-modify-write from the client.
    pub fn increment_completed_chunks(&self, id: &str) -> Result<(), DatabaseError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE jobs SET completed_chunks = completed_chunks + 1, updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    /// Server-side decrement, used when retry-failed resets chunk rows.
    pub fn decrement_completed_chunks(&self, id: &str, by: u32) -> Result<(), DatabaseError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE jobs SET completed_chunks = MAX(completed_chunks - ?1, 0), updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![by as i64, Utc::now().to_rfc3339(), id],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    /// Recompute the progress counter from chunk rows (resume path).
    pub fn recompute_completed_chunks(&self, id: &str) -> Result<(), DatabaseError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE jobs SET completed_chunks = (
                 SELECT COUNT(*) FROM chunks
                 WHERE job_id = ?1 AND status IN ('completed', 'failed')
             ), updated_at = ?2
             WHERE id = ?1",
            rusqlite::params![id, Utc::now().to_rfc3339()],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    /// List a job's chunks in index order.
    pub fn chunks_for_job(&self, job_id: &str) -> Result<Vec<ChunkRecord>, DatabaseError> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, job_id, chunk_index, input_text, output_text, status, error,
                        tokens, cost
                 FROM chunks WHERE job_id = ?1 ORDER BY chunk_index ASC",
            )
            .map_err(DatabaseError::from)?;
        let rows = stmt
            .query_map(rusqlite::params![job_id], row_to_chunk)
            .map_err(DatabaseError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Mark a chunk as in flight.
    pub fn start_chunk(&self, chunk_id: &str) -> Result<(), DatabaseError> {
        self.set_chunk_status(chunk_id, ChunkStatus::Processing)
    }

    /// Persist a successful chunk outcome.
    pub fn complete_chunk(
        &self,
        chunk_id: &str,
        output_text: &str,
        tokens: u64,
        cost: f64,
    ) -> Result<(), DatabaseError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE chunks SET status = 'completed', output_text = ?1, error = NULL,
                tokens = ?2, cost = ?3
             WHERE id = ?4",
            rusqlite::params![output_text, tokens as i64, cost, chunk_id],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    /// Persist a terminal chunk failure.
    pub fn fail_chunk(&self, chunk_id: &str, error: &str) -> Result<(), DatabaseError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE chunks SET status = 'failed', error = ?1 WHERE id = ?2",
            rusqlite::params![error, chunk_id],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    /// Update a chunk's status only.
    pub fn set_chunk_status(
        &self,
        chunk_id: &str,
        status: ChunkStatus,
    ) -> Result<(), DatabaseError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE chunks SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.as_str(), chunk_id],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    /// Cancel every chunk of a job that has not reached a terminal state.
    pub fn cancel_open_chunks(&self, job_id: &str) -> Result<usize, DatabaseError> {
        let conn = self.db.lock();
        let n = conn
            .execute(
                "UPDATE chunks SET status = 'cancelled'
                 WHERE job_id = ?1 AND status IN ('pending', 'processing')",
                rusqlite::params![job_id],
            )
            .map_err(DatabaseError::from)?;
        Ok(n)
    }

    /// Reset failed chunks to pending, clearing output and error.
    /// Returns the number of rows reset.
    pub fn reset_failed_chunks(&self, job_id: &str) -> Result<usize, DatabaseError> {
        let conn = self.db.lock();
        let n = conn
            .execute(
                "UPDATE chunks SET status = 'pending', output_text = NULL, error = NULL,
                    tokens = 0, cost = 0
                 WHERE job_id = ?1 AND status = 'failed'",
                rusqlite::params![job_id],
            )
            .map_err(DatabaseError::from)?;
        Ok(n)
    }

    /// Reset chunks stranded in `processing` back to `pending` (resume path).
    pub fn reset_processing_chunks(&self, job_id: &str) -> Result<usize, DatabaseError> {
        let conn = self.db.lock();
        let n = conn
            .execute(
                "UPDATE chunks SET status = 'pending' WHERE job_id = ?1 AND status = 'processing'",
                rusqlite::params![job_id],
            )
            .map_err(DatabaseError::from)?;
        Ok(n)
    }

    /// The most recent job for a chat, regardless of status.
    pub fn latest_job_for_chat(&self, chat_id: &str) -> Result<Option<JobRecord>, DatabaseError> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, chat_id, status, total_chunks, completed_chunks, instruction,
                        model_id, enable_stitch_pass, stitched_output, created_at, updated_at
                 FROM jobs WHERE chat_id = ?1 ORDER BY created_at DESC LIMIT 1",
            )
            .map_err(DatabaseError::from)?;
        let mut rows = stmt
            .query_map(rusqlite::params![chat_id], row_to_job)
            .map_err(DatabaseError::from)?;
        match rows.next() {
            Some(Ok(job)) => Ok(Some(job)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// The most recent non-terminal job for a chat, if any.
    pub fn active_job_for_chat(&self, chat_id: &str) -> Result<Option<JobRecord>, DatabaseError> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, chat_id, status, total_chunks, completed_chunks, instruction,
                        model_id, enable_stitch_pass, stitched_output, created_at, updated_at
                 FROM jobs
                 WHERE chat_id = ?1 AND status IN ('pending', 'processing', 'stitching')
                 ORDER BY created_at DESC LIMIT 1",
            )
            .map_err(DatabaseError::from)?;
        let mut rows = stmt
            .query_map(rusqlite::params![chat_id], row_to_job)
            .map_err(DatabaseError::from)?;
        match rows.next() {
            Some(Ok(job)) => Ok(Some(job)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<JobRecord, rusqlite::Error> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(JobRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        status: JobStatus::from_str(&status),
        total_chunks: row.get::<_, i64>(3)? as u32,
        completed_chunks: row.get::<_, i64>(4)? as u32,
        instruction: row.get(5)?,
        model_id: row.get(6)?,
        enable_stitch_pass: row.get::<_, i64>(7)? != 0,
        stitched_output: row.get(8)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> Result<ChunkRecord, rusqlite::Error> {
    let status: String = row.get(5)?;
    Ok(ChunkRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        index: row.get::<_, i64>(2)? as u32,
        input_text: row.get(3)?,
        output_text: row.get(4)?,
        status: ChunkStatus::from_str(&status),
        error: row.get(6)?,
        tokens: row.get::<_, i64>(7)? as u64,
        cost: row.get(8)?,
    })
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
