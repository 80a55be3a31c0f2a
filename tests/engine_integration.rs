//! Integration tests for the chunk-processing HTTP surface.
//!
//! Each test spins up the real Axum router on a random port with a stub
//! provider and an in-memory database, then exercises the HTTP contract —
//! including the SSE progress stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;

use longform::api::{router, AppState};
use longform::config::EngineConfig;
use longform::engine::EngineDeps;
use longform::error::LlmError;
use longform::llm::{
    CompletionRequest, CompletionResponse, LlmProvider, ModelInfo, StaticCatalog, Usage,
};
use longform::store::{ChatStore, ChunkStatus, Database, JobStatus, JobStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// What the stub provider does with each chunk call.
#[derive(Clone, Copy)]
enum StubMode {
    /// Return the chunk body uppercased.
    Uppercase,
    /// Return the chunk body unchanged.
    Echo,
    /// Return a fixed 4,010-char body (just over 1,000 estimated tokens).
    Oversize,
}

/// Stub chat-completion provider. No real API calls.
struct StubLlm {
    mode: StubMode,
    calls: AtomicUsize,
}

/// Pull the chunk body out of the bookended user message.
fn extract_body(content: &str) -> &str {
    let start = content.find("---\n").map(|i| i + 4).unwrap_or(0);
    let end = content.rfind("\n---").unwrap_or(content.len());
    &content[start..end]
}

#[async_trait]
impl LlmProvider for StubLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let user = request
            .messages
            .iter()
            .find(|m| m.role == "user")
            .expect("chunk call always has a user message");
        let body = extract_body(&user.content);
        let content = match self.mode {
            StubMode::Uppercase => body.to_uppercase(),
            StubMode::Echo => body.to_string(),
            StubMode::Oversize => "a".repeat(4010),
        };
        Ok(CompletionResponse {
            content,
            finish_reason: Some("stop".to_string()),
            usage: Usage {
                tokens: 50,
                cost: 0.0005,
            },
        })
    }
}

fn test_catalog() -> StaticCatalog {
    StaticCatalog::new([
        // Generous window: most inputs fit in one chunk.
        ModelInfo {
            id: "test/big".into(),
            name: "Big".into(),
            context_length: 128_000,
            max_output: Some(64_000),
            input_price_per_million: 0.5,
            output_price_per_million: 1.5,
            is_free: false,
        },
        // Output-capped: chunk budget bottoms out at the 2,000-token floor,
        // and the stitch window is 2,223 tokens.
        ModelInfo {
            id: "test/tiny".into(),
            name: "Tiny".into(),
            context_length: 8192,
            max_output: Some(2223),
            input_price_per_million: 0.0,
            output_price_per_million: 0.0,
            is_free: true,
        },
        // Dense-script sizing: 4,000-token chunks for the overlap scenario.
        ModelInfo {
            id: "test/dense".into(),
            name: "Dense".into(),
            context_length: 131_072,
            max_output: Some(4445),
            input_price_per_million: 1.0,
            output_price_per_million: 2.0,
            is_free: false,
        },
    ])
}

/// Start a server on a random port. Returns its base URL, the shared deps
/// (for direct store assertions), and the stub for call counting.
async fn start_server(mode: StubMode) -> (String, EngineDeps, Arc<StubLlm>) {
    let stub = Arc::new(StubLlm {
        mode,
        calls: AtomicUsize::new(0),
    });
    let db = Arc::new(Database::open_in_memory().unwrap());
    let deps = EngineDeps {
        jobs: Arc::new(JobStore::new(Arc::clone(&db))),
        chats: Arc::new(ChatStore::new(Arc::clone(&db))),
        llm: stub.clone(),
        catalog: Arc::new(test_catalog()),
        config: EngineConfig {
            progress_poll_interval: Duration::from_millis(50),
            ..EngineConfig::default()
        },
    };
    let app = router(AppState { deps: deps.clone() });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://127.0.0.1:{port}"), deps, stub)
}

async fn create_chat(client: &reqwest::Client, base: &str) -> String {
    let resp: Value = client
        .post(format!("{base}/chats"))
        .json(&json!({ "title": "test chat" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    resp["id"].as_str().unwrap().to_string()
}

async fn start_job(client: &reqwest::Client, base: &str, body: Value) -> (reqwest::StatusCode, Value) {
    let resp = client
        .post(format!("{base}/chunk-process"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status();
    (status, resp.json().await.unwrap())
}

/// Poll the store until the job reaches a terminal state.
async fn wait_for_terminal(deps: &EngineDeps, job_id: &str) -> JobStatus {
    loop {
        let job = deps.jobs.require_job(job_id).unwrap();
        if job.status.is_terminal() {
            return job.status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Happy paths ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_chunk_job_completes_with_uppercased_output() {
    timeout(TEST_TIMEOUT, async {
        let (base, deps, stub) = start_server(StubMode::Uppercase).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        let text = "the quick brown fox. ".repeat(143); // ~3,000 ASCII chars
        let (status, body) = start_job(
            &client,
            &base,
            json!({
                "chatId": chat_id,
                "text": text,
                "instruction": "Uppercase",
                "modelId": "test/big"
            }),
        )
        .await;

        assert_eq!(status, reqwest::StatusCode::ACCEPTED);
        assert_eq!(body["totalChunks"], 1);
        let job_id = body["jobId"].as_str().unwrap();

        assert_eq!(wait_for_terminal(&deps, job_id).await, JobStatus::Completed);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        let job = deps.jobs.require_job(job_id).unwrap();
        assert_eq!(job.completed_chunks, 1);
        assert_eq!(
            job.stitched_output.as_deref(),
            Some(text.to_uppercase().as_str())
        );

        // Exactly one assistant message carries the artifact.
        let messages = deps.chats.messages_for_chat(&chat_id).unwrap();
        let assistants: Vec<_> = messages.iter().filter(|m| m.role == "assistant").collect();
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].content, text.to_uppercase());
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dense_script_job_chunks_and_joins_in_index_order() {
    timeout(TEST_TIMEOUT, async {
        let (base, deps, _stub) = start_server(StubMode::Echo).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        // 60k Devanagari chars = 40k estimated tokens against a 4,000-token
        // chunk budget.
        let text = "कखगघङ".repeat(12_000);
        let (status, body) = start_job(
            &client,
            &base,
            json!({
                "chatId": chat_id,
                "text": text,
                "instruction": "Echo",
                "modelId": "test/dense"
            }),
        )
        .await;

        assert_eq!(status, reqwest::StatusCode::ACCEPTED);
        let total = body["totalChunks"].as_u64().unwrap();
        assert!((9..=12).contains(&total), "expected ~10 chunks, got {total}");

        let job_id = body["jobId"].as_str().unwrap();
        assert_eq!(wait_for_terminal(&deps, job_id).await, JobStatus::Completed);

        let job = deps.jobs.require_job(job_id).unwrap();
        assert_eq!(job.completed_chunks as u64, total);

        // Final output is the echoed chunks joined in index order.
        let chunks = deps.jobs.chunks_for_job(job_id).unwrap();
        let expected = chunks
            .iter()
            .map(|c| c.input_text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        assert_eq!(job.stitched_output.as_deref(), Some(expected.as_str()));

        // Consecutive chunks overlap: each starts with the tail of the
        // previous one (hard cuts on boundary-free text keep it exact).
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0]
                .input_text
                .chars()
                .rev()
                .take(100)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            assert!(
                pair[1].input_text.starts_with(&prev_tail),
                "chunk {} does not overlap its predecessor",
                pair[1].index
            );
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversize_outputs_skip_the_stitch_pass() {
    timeout(TEST_TIMEOUT, async {
        let (base, deps, stub) = start_server(StubMode::Oversize).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        // 9,000 ASCII chars = 2,250 tokens against a 2,000-token budget:
        // two chunks. Each stub output is ~1,003 tokens, so the combined
        // 2,006 exceeds 0.9 x 2,223 and the stitch pass must be skipped.
        let text = "b".repeat(9000);
        let (_, body) = start_job(
            &client,
            &base,
            json!({
                "chatId": chat_id,
                "text": text,
                "instruction": "Expand",
                "modelId": "test/tiny",
                "enableStitchPass": true
            }),
        )
        .await;

        let total = body["totalChunks"].as_u64().unwrap();
        assert_eq!(total, 2);
        let job_id = body["jobId"].as_str().unwrap();

        assert_eq!(wait_for_terminal(&deps, job_id).await, JobStatus::Completed);

        // Two chunk calls and nothing else: no stitch call happened.
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
        let job = deps.jobs.require_job(job_id).unwrap();
        let expected = format!("{}\n\n{}", "a".repeat(4010), "a".repeat(4010));
        assert_eq!(job.stitched_output.as_deref(), Some(expected.as_str()));
    })
    .await
    .expect("test timed out");
}

// ── Estimate & validation ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn estimate_returns_preview_without_side_effects() {
    timeout(TEST_TIMEOUT, async {
        let (base, deps, stub) = start_server(StubMode::Echo).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        let resp = client
            .post(format!("{base}/chunk-process?estimate=true"))
            .json(&json!({
                "chatId": chat_id,
                "text": "word ".repeat(1000),
                "instruction": "Translate to German",
                "modelId": "test/big"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["chunkCount"], 1);
        assert!(body["estimatedInputTokens"].as_u64().unwrap() > 1000);
        assert!(body["estimatedCost"].as_f64().unwrap() > 0.0);

        // No job was created and no provider call was made.
        assert!(deps.jobs.latest_job_for_chat(&chat_id).unwrap().is_none());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_rejects_bad_inputs() {
    timeout(TEST_TIMEOUT, async {
        let (base, _deps, _stub) = start_server(StubMode::Echo).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        let cases = [
            json!({ "chatId": chat_id, "text": "  ", "instruction": "x", "modelId": "test/big" }),
            json!({ "chatId": chat_id, "text": "body", "instruction": "", "modelId": "test/big" }),
            json!({ "chatId": "missing", "text": "body", "instruction": "x", "modelId": "test/big" }),
            json!({ "chatId": chat_id, "text": "body", "instruction": "x", "modelId": "test/nope" }),
        ];
        for case in cases {
            let (status, _) = start_job(&client, &base, case.clone()).await;
            assert_eq!(
                status,
                reqwest::StatusCode::BAD_REQUEST,
                "case not rejected: {case}"
            );
        }

        // Unknown job ids are 404s on the control endpoints.
        let resp = client
            .post(format!("{base}/chunk-process/no-such-job/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

// ── Retry / resume / cancel ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_with_no_failed_chunks_is_a_no_op() {
    timeout(TEST_TIMEOUT, async {
        let (base, deps, _stub) = start_server(StubMode::Uppercase).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        let (_, body) = start_job(
            &client,
            &base,
            json!({
                "chatId": chat_id,
                "text": "small document",
                "instruction": "Uppercase",
                "modelId": "test/big"
            }),
        )
        .await;
        let job_id = body["jobId"].as_str().unwrap().to_string();
        wait_for_terminal(&deps, &job_id).await;

        for _ in 0..2 {
            let resp: Value = client
                .post(format!("{base}/chunk-process/{job_id}/retry"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(resp["retriedChunks"], 0);
            assert_eq!(
                deps.jobs.require_job(&job_id).unwrap().status,
                JobStatus::Completed
            );
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_finishes_orphaned_chunks_with_one_artifact() {
    timeout(TEST_TIMEOUT, async {
        let (base, deps, _stub) = start_server(StubMode::Echo).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        // Build a crashed job by hand: 0-3 completed, 4-5 stranded in
        // processing, 6-9 never started.
        let chunks: Vec<longform::chunker::TextChunk> = (0..10)
            .map(|i| longform::chunker::TextChunk {
                index: i,
                text: format!("part {i}"),
            })
            .collect();
        let job_id = deps
            .jobs
            .insert_job(longform::store::NewJob {
                chat_id: &chat_id,
                instruction: "Echo",
                model_id: "test/big",
                enable_stitch_pass: false,
                chunks: &chunks,
            })
            .unwrap();
        let rows = deps.jobs.chunks_for_job(&job_id).unwrap();
        for row in &rows[0..4] {
            deps.jobs
                .complete_chunk(&row.id, &format!("part {}", row.index), 10, 0.0)
                .unwrap();
            deps.jobs.increment_completed_chunks(&job_id).unwrap();
        }
        for row in &rows[4..6] {
            deps.jobs.start_chunk(&row.id).unwrap();
        }

        let resp: Value = client
            .post(format!("{base}/chunk-process/{job_id}/resume"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["resumedChunks"], 6);

        assert_eq!(wait_for_terminal(&deps, &job_id).await, JobStatus::Completed);

        let job = deps.jobs.require_job(&job_id).unwrap();
        assert_eq!(job.completed_chunks, 10);
        let rows = deps.jobs.chunks_for_job(&job_id).unwrap();
        assert!(rows.iter().all(|c| c.status == ChunkStatus::Completed));

        let expected = (0..10).map(|i| format!("part {i}")).collect::<Vec<_>>().join("\n\n");
        assert_eq!(job.stitched_output.as_deref(), Some(expected.as_str()));

        let assistants = deps
            .chats
            .messages_for_chat(&chat_id)
            .unwrap()
            .into_iter()
            .filter(|m| m.role == "assistant")
            .count();
        assert_eq!(assistants, 1);

        // Resuming a finished job is a conflict.
        let resp = client
            .post(format!("{base}/chunk-process/{job_id}/resume"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_endpoint_rejects_terminal_jobs() {
    timeout(TEST_TIMEOUT, async {
        let (base, deps, _stub) = start_server(StubMode::Uppercase).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        let (_, body) = start_job(
            &client,
            &base,
            json!({
                "chatId": chat_id,
                "text": "done quickly",
                "instruction": "Uppercase",
                "modelId": "test/big"
            }),
        )
        .await;
        let job_id = body["jobId"].as_str().unwrap().to_string();
        wait_for_terminal(&deps, &job_id).await;

        let resp = client
            .post(format!("{base}/chunk-process/{job_id}/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
    })
    .await
    .expect("test timed out");
}

// ── Documents & progress stream ─────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn document_endpoint_reassembles_chunk_inputs() {
    timeout(TEST_TIMEOUT, async {
        let (base, deps, _stub) = start_server(StubMode::Echo).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        let (_, body) = start_job(
            &client,
            &base,
            json!({
                "chatId": chat_id,
                "text": "the original document body",
                "instruction": "Echo",
                "modelId": "test/big"
            }),
        )
        .await;
        wait_for_terminal(&deps, body["jobId"].as_str().unwrap()).await;

        let doc: Value = client
            .get(format!("{base}/chats/{chat_id}/document"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(doc["document"], "the original document body");

        // A chat with no jobs has no document.
        let other = create_chat(&client, &base).await;
        let resp = client
            .get(format!("{base}/chats/{other}/document"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_job_reports_running_then_none() {
    timeout(TEST_TIMEOUT, async {
        let (base, deps, _stub) = start_server(StubMode::Echo).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        let resp: Value = client
            .get(format!("{base}/chats/{chat_id}/active-job"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(resp["jobId"].is_null());

        let (_, body) = start_job(
            &client,
            &base,
            json!({
                "chatId": chat_id,
                "text": "short",
                "instruction": "Echo",
                "modelId": "test/big"
            }),
        )
        .await;
        wait_for_terminal(&deps, body["jobId"].as_str().unwrap()).await;

        let resp: Value = client
            .get(format!("{base}/chats/{chat_id}/active-job"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(resp["jobId"].is_null(), "terminal job must not be active");
    })
    .await
    .expect("test timed out");
}

/// Collect `data:` payloads from an SSE body until the stream closes.
async fn read_sse_frames(resp: reqwest::Response) -> Vec<Value> {
    let mut frames = Vec::new();
    let mut buffer = String::new();
    let mut stream = resp.bytes_stream();
    while let Some(Ok(bytes)) = stream.next().await {
        buffer.push_str(&String::from_utf8_lossy(&bytes));
        while let Some(pos) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..pos + 2).collect();
            for line in frame.lines() {
                if let Some(data) = line.strip_prefix("data: ") {
                    if let Ok(value) = serde_json::from_str(data) {
                        frames.push(value);
                    }
                }
            }
        }
    }
    frames
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_stream_ends_with_terminal_snapshot_and_done() {
    timeout(TEST_TIMEOUT, async {
        let (base, _deps, _stub) = start_server(StubMode::Uppercase).await;
        let client = reqwest::Client::new();
        let chat_id = create_chat(&client, &base).await;

        let (_, body) = start_job(
            &client,
            &base,
            json!({
                "chatId": chat_id,
                "text": "stream me",
                "instruction": "Uppercase",
                "modelId": "test/big"
            }),
        )
        .await;
        let job_id = body["jobId"].as_str().unwrap();

        let resp = client
            .get(format!("{base}/chunk-process/{job_id}/stream"))
            .send()
            .await
            .unwrap();
        let frames = read_sse_frames(resp).await;
        assert!(frames.len() >= 2, "expected snapshots plus done sentinel");

        let done = frames.last().unwrap();
        assert_eq!(done["done"], true);

        let terminal = &frames[frames.len() - 2];
        assert_eq!(terminal["status"], "completed");
        assert_eq!(terminal["completedChunks"], terminal["totalChunks"]);
        assert_eq!(terminal["stitchedOutput"], "STREAM ME");
        assert_eq!(terminal["isStale"], false);
        assert!(terminal["chunks"].as_array().unwrap().len() >= 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stream_for_unknown_job_sends_error_frame() {
    timeout(TEST_TIMEOUT, async {
        let (base, _deps, _stub) = start_server(StubMode::Echo).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{base}/chunk-process/ghost/stream"))
            .send()
            .await
            .unwrap();
        let frames = read_sse_frames(resp).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0]["error"].as_str().unwrap().contains("ghost"));
    })
    .await
    .expect("test timed out");
}
