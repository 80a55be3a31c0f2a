//! Token estimation and chunk-budget sizing.
//!
//! Both the planner that creates a job and the cost estimator size chunks
//! through [`chunk_size_tokens`], so a pre-run preview matches what runs.

/// Tokens reserved for the system message.
const SYSTEM_PROMPT_RESERVE: usize = 500;
/// Tokens reserved for message framing and position hints.
const METADATA_RESERVE: usize = 100;
/// Tokens repeated from the previous chunk for cross-boundary context.
pub const OVERLAP_TOKENS: usize = 200;
/// Floor that guarantees forward progress on small-window models.
const MIN_CHUNK_TOKENS: usize = 2000;
/// Share of the context window given to chunk input; the rest covers the
/// model's reply plus safety margin.
const CONTEXT_INPUT_FRACTION: f64 = 0.40;
/// Usable share of the model's declared max output.
const OUTPUT_FRACTION: f64 = 0.9;

/// Estimate tokens for arbitrary text with a two-class heuristic.
///
/// ASCII code points count at 4 chars/token; everything above U+007F counts
/// at 1.5 chars/token. Non-Latin scripts tokenize 2-3x denser than English,
/// and a flat `len/4` undersizes chunks enough to blow the output limit on
/// translation-style tasks.
pub fn estimate_tokens(text: &str) -> usize {
    let mut ascii = 0usize;
    let mut non_ascii = 0usize;
    for c in text.chars() {
        if (c as u32) <= 127 {
            ascii += 1;
        } else {
            non_ascii += 1;
        }
    }
    (ascii as f64 / 4.0 + non_ascii as f64 / 1.5).ceil() as usize
}

/// Compute the maximum safe token budget per chunk.
///
/// Takes the smaller of the context-window share and the usable output
/// window, clamped to [`MIN_CHUNK_TOKENS`] from below.
pub fn chunk_size_tokens(
    context_length: usize,
    instruction_tokens: usize,
    max_output_tokens: Option<usize>,
) -> usize {
    let context_limit = CONTEXT_INPUT_FRACTION * context_length as f64
        - SYSTEM_PROMPT_RESERVE as f64
        - instruction_tokens as f64
        - METADATA_RESERVE as f64
        - OVERLAP_TOKENS as f64;

    let output_limit = max_output_tokens
        .map(|m| (OUTPUT_FRACTION * m as f64).floor())
        .unwrap_or(f64::INFINITY);

    let limit = context_limit.min(output_limit).floor();
    (limit.max(MIN_CHUNK_TOKENS as f64)) as usize
}
