//! Bounded-parallel chunk dispatch with retry, cancellation, and
//! finalization.
//!
//! One [`JobRunner`] task owns a job from dispatch through finalization.
//! Workers are plain tokio tasks; the dispatcher launches them while the
//! in-flight count stays under the concurrency cap and the job has not been
//! cancelled, re-reading the persisted status before every launch so a
//! cancel lands at the next dispatch check.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::{prompts, stitcher};
use crate::error::Error;
use crate::llm::{CompletionRequest, LlmProvider, ModelDirectory};
use crate::store::{ChatStore, ChunkRecord, ChunkStatus, JobStatus, JobStore};

/// Prefix of the assistant message inserted when a job fails outright.
pub const FAILURE_PREFIX: &str = "[Big Context Processing Failed]";

/// Shared dependencies for job execution.
#[derive(Clone)]
pub struct EngineDeps {
    pub jobs: Arc<JobStore>,
    pub chats: Arc<ChatStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub catalog: Arc<dyn ModelDirectory>,
    pub config: EngineConfig,
}

/// Runs one job's chunks through the provider and closes the job out.
#[derive(Clone)]
pub struct JobRunner {
    deps: EngineDeps,
}

impl JobRunner {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    /// Launch the runner as a detached task. Infrastructure failures are
    /// caught here: the job is marked failed and the chat gets a failure
    /// notice, so a crashed run never strands a `processing` row silently.
    pub fn spawn(self, job_id: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_job(&job_id).await {
                error!(job_id = %job_id, error = %e, "Job run failed");
                let _ = self
                    .deps
                    .jobs
                    .finalize_job(&job_id, JobStatus::Failed, None);
                if let Ok(job) = self.deps.jobs.require_job(&job_id) {
                    self.insert_final_message(
                        &job.chat_id,
                        &job.created_at,
                        &format!("{FAILURE_PREFIX} {e}"),
                    );
                }
            }
        })
    }

    /// Process every pending chunk of the job, then finalize.
    pub async fn run_job(&self, job_id: &str) -> Result<(), Error> {
        let job = self.deps.jobs.require_job(job_id)?;
        let max_tokens = self.model_max_output(&job.model_id).await;

        let pending: Vec<ChunkRecord> = self
            .deps
            .jobs
            .chunks_for_job(job_id)?
            .into_iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .collect();

        info!(
            job_id = %job_id,
            pending = pending.len(),
            total = job.total_chunks,
            model = %job.model_id,
            "Dispatching job"
        );

        self.dispatch(job_id, &job.instruction, &job.model_id, job.total_chunks, max_tokens, pending)
            .await?;
        self.finalize(job_id).await
    }

    /// The dispatch loop: keep at most `max_concurrency` workers in flight,
    /// stop launching once the persisted status reads cancelled, and return
    /// when every launched worker has recorded an outcome.
    async fn dispatch(
        &self,
        job_id: &str,
        instruction: &str,
        model_id: &str,
        total_chunks: u32,
        max_tokens: Option<u32>,
        queue: Vec<ChunkRecord>,
    ) -> Result<(), Error> {
        let max_concurrency = self.deps.config.max_concurrency;
        let mut next = 0usize;
        let mut active = 0usize;
        let mut cancelled = false;
        let mut workers: JoinSet<()> = JoinSet::new();

        while next < queue.len() || active > 0 {
            while !cancelled && active < max_concurrency && next < queue.len() {
                if self.deps.jobs.require_job(job_id)?.status == JobStatus::Cancelled {
                    info!(job_id = %job_id, launched = next, "Cancellation observed; halting dispatch");
                    cancelled = true;
                    break;
                }

                let runner = self.clone();
                let chunk = queue[next].clone();
                let instruction = instruction.to_string();
                let model_id = model_id.to_string();
                let job_id = job_id.to_string();
                workers.spawn(async move {
                    runner
                        .process_chunk(&job_id, &instruction, &model_id, total_chunks, max_tokens, chunk)
                        .await;
                });
                next += 1;
                active += 1;
            }

            if active == 0 {
                break;
            }
            workers.join_next().await;
            active -= 1;
        }

        Ok(())
    }

    /// Run one chunk to a recorded outcome. Failures are persisted, never
    /// propagated: a chunk failing is part of the job's normal life.
    async fn process_chunk(
        &self,
        job_id: &str,
        instruction: &str,
        model_id: &str,
        total_chunks: u32,
        max_tokens: Option<u32>,
        chunk: ChunkRecord,
    ) {
        if let Err(e) = self.deps.jobs.start_chunk(&chunk.id) {
            warn!(chunk = chunk.index, error = %e, "Failed to mark chunk processing");
        }

        let request = CompletionRequest {
            model: model_id.to_string(),
            messages: prompts::chunk_messages(instruction, &chunk.input_text, chunk.index, total_chunks),
            max_tokens,
        };

        match self.complete_with_retry(request, chunk.index).await {
            Ok(resp) => {
                debug!(job_id = %job_id, chunk = chunk.index, tokens = resp.usage.tokens, "Chunk completed");
                if let Err(e) = self.deps.jobs.complete_chunk(
                    &chunk.id,
                    &resp.content,
                    resp.usage.tokens,
                    resp.usage.cost,
                ) {
                    warn!(chunk = chunk.index, error = %e, "Failed to persist chunk output");
                }
                if let Err(e) = self.deps.chats.record_api_call(
                    job_id,
                    "chunk",
                    model_id,
                    resp.usage.tokens,
                    resp.usage.cost,
                ) {
                    warn!(chunk = chunk.index, error = %e, "Failed to record api call");
                }
            }
            Err(e) => {
                warn!(job_id = %job_id, chunk = chunk.index, error = %e, "Chunk failed");
                if let Err(e) = self.deps.jobs.fail_chunk(&chunk.id, &e.to_string()) {
                    warn!(chunk = chunk.index, error = %e, "Failed to persist chunk failure");
                }
            }
        }

        // Progress accounting covers failures too, so the counter always
        // reaches total_chunks once every chunk has an outcome.
        if let Err(e) = self.deps.jobs.increment_completed_chunks(job_id) {
            warn!(job_id = %job_id, error = %e, "Failed to advance progress counter");
        }
    }

    /// Call the provider, retrying only rate limits with exponential
    /// back-off. Network and server errors fail on the first attempt —
    /// retrying a persistent outage only multiplies cost.
    async fn complete_with_retry(
        &self,
        request: CompletionRequest,
        chunk_index: u32,
    ) -> Result<crate::llm::CompletionResponse, crate::error::LlmError> {
        let max_retries = self.deps.config.max_retries.max(1);
        let mut delay = self.deps.config.retry_base_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.deps.llm.complete(request.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    warn!(
                        chunk = chunk_index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the job out: assemble the artifact, write the terminal state,
    /// and append the one assistant message.
    async fn finalize(&self, job_id: &str) -> Result<(), Error> {
        let job = self.deps.jobs.require_job(job_id)?;
        if job.status == JobStatus::Cancelled {
            info!(job_id = %job_id, "Job cancelled; skipping finalization");
            return Ok(());
        }

        let chunks = self.deps.jobs.chunks_for_job(job_id)?;
        let outputs: Vec<String> = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .filter_map(|c| c.output_text.clone())
            .collect();
        let failed = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .count();

        if outputs.is_empty() {
            error!(job_id = %job_id, failed, "Every chunk failed");
            self.deps
                .jobs
                .finalize_job(job_id, JobStatus::Failed, None)?;
            self.insert_final_message(
                &job.chat_id,
                &job.created_at,
                &format!("{FAILURE_PREFIX} All {} sections failed to process.", job.total_chunks),
            );
            return Ok(());
        }

        let (context_length, max_output) = self.model_limits(&job.model_id).await;
        let effective = stitcher::effective_max_output(context_length, max_output);
        if stitcher::plan(&outputs, job.enable_stitch_pass, effective) == stitcher::StitchPlan::RemotePass {
            self.deps.jobs.set_job_status(job_id, JobStatus::Stitching)?;
        }

        let result = stitcher::assemble(
            &self.deps.llm,
            &outputs,
            &job.instruction,
            &job.model_id,
            context_length,
            max_output,
            job.enable_stitch_pass,
        )
        .await;

        if let Some(usage) = result.usage {
            if let Err(e) = self.deps.chats.record_api_call(
                job_id,
                "stitch",
                &job.model_id,
                usage.tokens,
                usage.cost,
            ) {
                warn!(job_id = %job_id, error = %e, "Failed to record stitch call");
            }
        }

        self.deps
            .jobs
            .finalize_job(job_id, JobStatus::Completed, Some(&result.text))?;
        self.insert_final_message(&job.chat_id, &job.created_at, &result.text);

        info!(
            job_id = %job_id,
            outputs = outputs.len(),
            failed,
            stitched = result.usage.is_some(),
            "Job completed"
        );
        Ok(())
    }

    /// Append the job's one assistant message, unless an earlier run of the
    /// finalizer already did — a resumed job that crashed after finalization
    /// must not produce a duplicate artifact.
    fn insert_final_message(
        &self,
        chat_id: &str,
        job_created_at: &chrono::DateTime<chrono::Utc>,
        content: &str,
    ) {
        match self
            .deps
            .chats
            .assistant_message_exists_since(chat_id, *job_created_at)
        {
            Ok(true) => {
                info!(chat_id = chat_id, "Assistant message already present; skipping insert");
            }
            Ok(false) => {
                if let Err(e) = self.deps.chats.insert_message(chat_id, "assistant", content) {
                    warn!(chat_id = chat_id, error = %e, "Failed to insert assistant message");
                }
            }
            Err(e) => {
                warn!(chat_id = chat_id, error = %e, "Failed to check for existing assistant message");
            }
        }
    }

    async fn model_max_output(&self, model_id: &str) -> Option<u32> {
        self.model_limits(model_id).await.1.map(|m| m as u32)
    }

    /// Model window limits, or a no-stitch fallback when the catalog cannot
    /// answer (a zero budget always routes assembly to concatenation).
    async fn model_limits(&self, model_id: &str) -> (usize, Option<usize>) {
        match self.deps.catalog.get(model_id).await {
            Ok(Some(info)) => (info.context_length, info.max_output),
            Ok(None) => {
                warn!(model = model_id, "Model missing from catalog; assembly will concatenate");
                (0, None)
            }
            Err(e) => {
                warn!(model = model_id, error = %e, "Catalog lookup failed; assembly will concatenate");
                (0, None)
            }
        }
    }
}
