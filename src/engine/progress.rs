//! Progress snapshots for the event stream.
//!
//! A snapshot is computed from one read of the job row plus its chunk list;
//! the aggregates come from that same chunk list, never a second query, so
//! a subscriber always sees a consistent view.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{ChunkRecord, ChunkStatus, JobRecord, JobStatus};

/// Per-chunk progress line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkProgress {
    pub index: u32,
    pub status: ChunkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One frame of the progress stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub chunks: Vec<ChunkProgress>,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub failed_chunks: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub model: String,
    pub is_stale: bool,
    pub stale_duration_ms: u64,
    /// Present only once the job is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stitched_output: Option<String>,
}

impl JobSnapshot {
    /// Build a snapshot. `stale_threshold` is how long `updated_at` may sit
    /// still while the job is processing before the stream flags it; every
    /// chunk outcome advances `updated_at`, so a stalled timestamp means an
    /// orphaned run (e.g. the owning process died).
    pub fn build(
        job: &JobRecord,
        chunks: &[ChunkRecord],
        stale_threshold: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let total_tokens: u64 = chunks.iter().map(|c| c.tokens).sum();
        let total_cost: f64 = chunks.iter().map(|c| c.cost).sum();
        let failed_chunks = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .count();

        let idle_ms = (now - job.updated_at).num_milliseconds().max(0) as u64;
        let is_stale = job.status == JobStatus::Processing
            && job.completed_chunks < job.total_chunks
            && idle_ms >= stale_threshold.as_millis() as u64;

        Self {
            id: job.id.clone(),
            status: job.status,
            total_chunks: job.total_chunks,
            completed_chunks: job.completed_chunks,
            chunks: chunks
                .iter()
                .map(|c| ChunkProgress {
                    index: c.index,
                    status: c.status,
                    error: c.error.clone(),
                })
                .collect(),
            total_tokens,
            total_cost,
            failed_chunks,
            started_at: job.created_at,
            updated_at: job.updated_at,
            model: job.model_id.clone(),
            is_stale,
            stale_duration_ms: if is_stale { idle_ms } else { 0 },
            stitched_output: if job.status.is_terminal() {
                job.stitched_output.clone()
            } else {
                None
            },
        }
    }
}
