//! Control endpoints and the progress event stream.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::error::{ApiError, ApiResult};
use crate::chunker::chunk_text;
use crate::engine::progress::JobSnapshot;
use crate::engine::scheduler::{EngineDeps, JobRunner};
use crate::store::{JobStatus, NewJob};
use crate::tokens::{chunk_size_tokens, estimate_tokens};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub deps: EngineDeps,
}

/// Build the Axum router with all engine routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chats", post(create_chat))
        .route("/chats/{id}/messages", get(chat_messages))
        .route("/chats/{id}/document", get(chat_document))
        .route("/chats/{id}/active-job", get(chat_active_job))
        .route("/chunk-process", post(start_job))
        .route("/chunk-process/{id}/stream", get(job_stream))
        .route("/chunk-process/{id}/cancel", post(cancel_job))
        .route("/chunk-process/{id}/retry", post(retry_job))
        .route("/chunk-process/{id}/resume", post(resume_job))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "longform"
    }))
}

// ── Chats ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateChatRequest {
    title: Option<String>,
}

async fn create_chat(
    State(state): State<AppState>,
    Json(body): Json<CreateChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state.deps.chats.create_chat(body.title.as_deref())?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageDto {
    id: String,
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    created_at: String,
}

async fn chat_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Vec<MessageDto>>> {
    if !state.deps.chats.chat_exists(&chat_id)? {
        return Err(ApiError::NotFound(format!("chat {chat_id}")));
    }
    let messages = state
        .deps
        .chats
        .messages_for_chat(&chat_id)?
        .into_iter()
        .map(|m| MessageDto {
            id: m.id,
            role: m.role,
            content: m.content,
            summary: m.summary,
            created_at: m.created_at.to_rfc3339(),
        })
        .collect();
    Ok(Json(messages))
}

/// Reassemble the original document of a chat's latest job. Overlap is kept:
/// the user-visible document is exactly what was chunked.
async fn chat_document(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state
        .deps
        .jobs
        .latest_job_for_chat(&chat_id)?
        .ok_or_else(|| ApiError::NotFound(format!("document for chat {chat_id}")))?;

    let chunks = state.deps.jobs.chunks_for_job(&job.id)?;
    let document = chunks
        .iter()
        .map(|c| c.input_text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(Json(json!({ "jobId": job.id, "document": document })))
}

async fn chat_active_job(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.deps.jobs.active_job_for_chat(&chat_id)?;
    Ok(Json(json!({ "jobId": job.map(|j| j.id) })))
}

// ── Start / estimate ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    chat_id: String,
    text: String,
    instruction: String,
    model_id: String,
    #[serde(default)]
    enable_stitch_pass: bool,
}

#[derive(Debug, Deserialize)]
struct StartQuery {
    #[serde(default)]
    estimate: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EstimateResponse {
    chunk_count: usize,
    chunk_size_tokens: usize,
    estimated_input_tokens: usize,
    estimated_output_tokens: usize,
    estimated_cost: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    job_id: String,
    total_chunks: usize,
}

async fn start_job(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
    Json(req): Json<StartRequest>,
) -> ApiResult<axum::response::Response> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text is required".into()));
    }
    if req.instruction.trim().is_empty() {
        return Err(ApiError::BadRequest("instruction is required".into()));
    }
    if !state.deps.chats.chat_exists(&req.chat_id)? {
        return Err(ApiError::BadRequest(format!("unknown chatId: {}", req.chat_id)));
    }
    let model = state
        .deps
        .catalog
        .get(&req.model_id)
        .await?
        .ok_or_else(|| ApiError::BadRequest(format!("unknown modelId: {}", req.model_id)))?;

    let instruction_tokens = estimate_tokens(&req.instruction);
    let chunk_budget = chunk_size_tokens(model.context_length, instruction_tokens, model.max_output);
    let chunks = chunk_text(&req.text, chunk_budget);

    if query.estimate {
        let input_tokens: usize = chunks.iter().map(|c| estimate_tokens(&c.text)).sum::<usize>()
            + chunks.len() * instruction_tokens;
        // Translation-style parity: assume output roughly matches input.
        let output_tokens = input_tokens;
        let estimated_cost = input_tokens as f64 / 1e6 * model.input_price_per_million
            + output_tokens as f64 / 1e6 * model.output_price_per_million;
        let estimate = EstimateResponse {
            chunk_count: chunks.len(),
            chunk_size_tokens: chunk_budget,
            estimated_input_tokens: input_tokens,
            estimated_output_tokens: output_tokens,
            estimated_cost,
        };
        return Ok(Json(estimate).into_response());
    }

    let job_id = state.deps.jobs.insert_job(NewJob {
        chat_id: &req.chat_id,
        instruction: &req.instruction,
        model_id: &req.model_id,
        enable_stitch_pass: req.enable_stitch_pass,
        chunks: &chunks,
    })?;

    state.deps.chats.insert_message(
        &req.chat_id,
        "system",
        &format!(
            "Big-context processing started: {} section(s) using {}.",
            chunks.len(),
            model.name
        ),
    )?;

    info!(job_id = %job_id, chunks = chunks.len(), model = %req.model_id, "Job accepted");
    JobRunner::new(state.deps.clone()).spawn(job_id.clone());

    let accepted = StartResponse {
        job_id,
        total_chunks: chunks.len(),
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

// ── Job controls ────────────────────────────────────────────────────────

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.deps.jobs.require_job(&job_id)?;
    if !job.status.can_transition_to(JobStatus::Cancelled) {
        return Err(ApiError::Conflict(format!("job is already {}", job.status)));
    }

    state.deps.jobs.set_job_status(&job_id, JobStatus::Cancelled)?;
    let cancelled = state.deps.jobs.cancel_open_chunks(&job_id)?;
    info!(job_id = %job_id, cancelled_chunks = cancelled, "Job cancelled");
    Ok(Json(json!({ "jobId": job_id, "status": "cancelled" })))
}

async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.deps.jobs.require_job(&job_id)?;
    if !job.status.is_terminal() {
        return Err(ApiError::Conflict(format!("job is still {}", job.status)));
    }

    let reset = state.deps.jobs.reset_failed_chunks(&job_id)?;
    if reset > 0 {
        state
            .deps
            .jobs
            .decrement_completed_chunks(&job_id, reset as u32)?;
        state.deps.jobs.set_job_status(&job_id, JobStatus::Processing)?;
        info!(job_id = %job_id, reset, "Retrying failed chunks");
        JobRunner::new(state.deps.clone()).spawn(job_id.clone());
    }
    Ok(Json(json!({ "jobId": job_id, "retriedChunks": reset })))
}

async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.deps.jobs.require_job(&job_id)?;
    if job.status.is_terminal() {
        return Err(ApiError::Conflict(format!("job is already {}", job.status)));
    }

    // Chunks stranded in flight by a dead process go back to pending, and
    // the counter is rebuilt from what actually reached a terminal outcome.
    state.deps.jobs.reset_processing_chunks(&job_id)?;
    state.deps.jobs.recompute_completed_chunks(&job_id)?;
    state.deps.jobs.set_job_status(&job_id, JobStatus::Processing)?;

    let pending = state
        .deps
        .jobs
        .chunks_for_job(&job_id)?
        .into_iter()
        .filter(|c| c.status == crate::store::ChunkStatus::Pending)
        .count();

    info!(job_id = %job_id, pending, "Resuming job");
    JobRunner::new(state.deps.clone()).spawn(job_id.clone());
    Ok(Json(json!({ "jobId": job_id, "resumedChunks": pending })))
}

// ── Progress stream ─────────────────────────────────────────────────────

enum StreamPhase {
    /// Emitting snapshots; `first` skips the initial poll delay.
    Snapshot { first: bool },
    /// Terminal snapshot sent; emit the done sentinel next.
    Done,
    Closed,
}

async fn job_stream(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let deps = state.deps.clone();

    let stream = stream::unfold(StreamPhase::Snapshot { first: true }, move |phase| {
        let deps = deps.clone();
        let job_id = job_id.clone();
        async move {
            match phase {
                StreamPhase::Snapshot { first } => {
                    if !first {
                        tokio::time::sleep(deps.config.progress_poll_interval).await;
                    }
                    match load_snapshot(&deps, &job_id) {
                        Ok(snapshot) => {
                            let terminal = snapshot.status.is_terminal();
                            let data = serde_json::to_string(&snapshot)
                                .unwrap_or_else(|_| "{}".to_string());
                            let next = if terminal {
                                StreamPhase::Done
                            } else {
                                StreamPhase::Snapshot { first: false }
                            };
                            Some((Ok(Event::default().data(data)), next))
                        }
                        Err(message) => {
                            let data = json!({ "error": message }).to_string();
                            Some((Ok(Event::default().data(data)), StreamPhase::Closed))
                        }
                    }
                }
                StreamPhase::Done => Some((
                    Ok(Event::default().data(json!({ "done": true }).to_string())),
                    StreamPhase::Closed,
                )),
                StreamPhase::Closed => None,
            }
        }
    });

    Sse::new(stream)
}

/// One consistent read of the job and its chunks for a stream frame.
fn load_snapshot(deps: &EngineDeps, job_id: &str) -> Result<JobSnapshot, String> {
    let job = deps
        .jobs
        .get_job(job_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("job {job_id} not found"))?;
    let chunks = deps.jobs.chunks_for_job(job_id).map_err(|e| e.to_string())?;
    Ok(JobSnapshot::build(
        &job,
        &chunks,
        deps.config.stale_threshold,
        Utc::now(),
    ))
}
