//! Assembly of per-chunk outputs.
//!
//! Concatenation is always lossless; the optional remote stitch pass trades
//! a model call for smoother seams. The pass is suppressed whenever the
//! combined outputs could not fit in a single reply — a stitch call that
//! cannot emit the full text in one response would truncate it.

use std::sync::Arc;

use crate::engine::prompts;
use crate::llm::{CompletionRequest, LlmProvider, Usage};
use crate::tokens::estimate_tokens;

/// Share of the output window the combined outputs may occupy before the
/// remote pass is ruled out.
const STITCH_OUTPUT_HEADROOM: f64 = 0.9;

/// When a model declares no max output, assume half its context window.
const DEFAULT_OUTPUT_SHARE: f64 = 0.5;

/// How the outputs will be assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchPlan {
    /// Zero or one output: returned unchanged.
    PassThrough,
    /// Joined with a blank line; no remote call.
    Concatenate,
    /// One remote call smooths the seams.
    RemotePass,
}

/// The assembled artifact, plus usage when a remote pass ran.
#[derive(Debug)]
pub struct StitchResult {
    pub text: String,
    pub usage: Option<Usage>,
}

/// The output budget a stitch reply would have to fit in.
pub fn effective_max_output(context_length: usize, max_output_tokens: Option<usize>) -> usize {
    max_output_tokens.unwrap_or((context_length as f64 * DEFAULT_OUTPUT_SHARE) as usize)
}

/// Decide how to assemble `outputs`.
pub fn plan(outputs: &[String], enable_stitch_pass: bool, effective_max_output: usize) -> StitchPlan {
    if outputs.len() <= 1 {
        return StitchPlan::PassThrough;
    }
    if !enable_stitch_pass {
        return StitchPlan::Concatenate;
    }
    let total_output_tokens: usize = outputs.iter().map(|o| estimate_tokens(o)).sum();
    if total_output_tokens as f64 > STITCH_OUTPUT_HEADROOM * effective_max_output as f64 {
        StitchPlan::Concatenate
    } else {
        StitchPlan::RemotePass
    }
}

/// Assemble the ordered chunk outputs into the final artifact.
///
/// A failed remote pass falls back to concatenation: the seams stay rough,
/// but no content is lost.
pub async fn assemble(
    llm: &Arc<dyn LlmProvider>,
    outputs: &[String],
    instruction: &str,
    model_id: &str,
    context_length: usize,
    max_output_tokens: Option<usize>,
    enable_stitch_pass: bool,
) -> StitchResult {
    let effective = effective_max_output(context_length, max_output_tokens);
    match plan(outputs, enable_stitch_pass, effective) {
        StitchPlan::PassThrough => StitchResult {
            text: outputs.first().cloned().unwrap_or_default(),
            usage: None,
        },
        StitchPlan::Concatenate => {
            tracing::info!(
                outputs = outputs.len(),
                "Stitch pass skipped; concatenating chunk outputs"
            );
            StitchResult {
                text: outputs.join("\n\n"),
                usage: None,
            }
        }
        StitchPlan::RemotePass => {
            let joined = outputs.join(prompts::CHUNK_BOUNDARY_MARKER);
            let request = CompletionRequest {
                model: model_id.to_string(),
                messages: prompts::stitch_messages(instruction, &joined),
                max_tokens: max_output_tokens.map(|m| m as u32),
            };
            match llm.complete(request).await {
                Ok(resp) => StitchResult {
                    text: resp.content,
                    usage: Some(resp.usage),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Stitch pass failed; falling back to concatenation");
                    StitchResult {
                        text: outputs.join("\n\n"),
                        usage: None,
                    }
                }
            }
        }
    }
}
