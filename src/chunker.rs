//! Boundary-aware text segmentation with overlap.
//!
//! Splits a document into ordered chunks sized by [`crate::tokens`], cutting
//! at the best natural boundary inside each window so chunks stay
//! semantically cohesive, and repeating a tail of each chunk at the start of
//! the next so the model can disambiguate sentences that cross a seam.

use crate::tokens::{estimate_tokens, OVERLAP_TOKENS};

/// One contiguous slice of the input, ready for a single remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// 0-based position within the job.
    pub index: usize,
    pub text: String,
}

/// Split `text` into ordered, overlapping chunks of at most
/// `max_chunk_tokens` estimated tokens each.
///
/// The estimator and the slicer must agree on a single chars/token ratio for
/// the actual text, so the character budget is derived from the measured
/// density rather than a fixed constant.
pub fn chunk_text(text: &str, max_chunk_tokens: usize) -> Vec<TextChunk> {
    let total_tokens = estimate_tokens(text);
    if total_tokens <= max_chunk_tokens {
        return vec![TextChunk {
            index: 0,
            text: text.to_string(),
        }];
    }

    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let chars_per_token = n as f64 / total_tokens.max(1) as f64;
    let max_chunk_chars = ((max_chunk_tokens as f64 * chars_per_token) as usize).max(1);
    let overlap_chars = (OVERLAP_TOKENS as f64 * chars_per_token) as usize;

    let mut chunks = Vec::new();
    let mut offset = 0usize;

    while offset < n {
        let mut end = (offset + max_chunk_chars).min(n);
        if end < n {
            end = find_break_point(&chars, offset, end);
        }

        let slice: String = chars[offset..end].iter().collect();
        let trimmed = slice.trim();
        if !trimmed.is_empty() {
            chunks.push(TextChunk {
                index: chunks.len(),
                text: trimmed.to_string(),
            });
        }

        if end >= n {
            break; // no trailing overlap
        }
        offset = end.saturating_sub(overlap_chars).max(offset + 1);
    }

    chunks
}

/// Find the best natural boundary in `[offset, end)`, restricted to the last
/// 30% of the window so chunks never get too short. Returns the absolute
/// char index the chunk should end at (exclusive).
///
/// Priority, highest first; within a level the match closest to `end` wins:
/// 1. section divider (`#`/`##`/`###` heading or a `===`/`---` rule line)
/// 2. double newline
/// 3. single newline
/// 4. sentence terminator followed by whitespace
/// 5. word boundary
/// 6. hard cut at the window edge
fn find_break_point(chars: &[char], offset: usize, end: usize) -> usize {
    let window = end - offset;
    let min_break = offset + (window as f64 * 0.7) as usize;

    // Level 1: newline followed by a section divider line.
    for i in (min_break..end).rev() {
        if chars[i] == '\n' && starts_section(chars, i + 1) {
            return i + 1;
        }
    }

    // Level 2: paragraph boundary.
    for i in (min_break..end.saturating_sub(1)).rev() {
        if chars[i] == '\n' && chars[i + 1] == '\n' {
            return i + 2;
        }
    }

    // Level 3: line boundary.
    for i in (min_break..end).rev() {
        if chars[i] == '\n' {
            return i + 1;
        }
    }

    // Level 4: sentence boundary.
    for i in (min_break..end.saturating_sub(1)).rev() {
        if matches!(chars[i], '.' | '!' | '?') && chars[i + 1].is_whitespace() {
            return i + 2;
        }
    }

    // Level 5: word boundary.
    for i in (min_break..end).rev() {
        if chars[i] == ' ' {
            return i + 1;
        }
    }

    // Level 6: hard cut.
    end
}

/// Whether the line starting at `pos` is a Markdown heading (`#`, `##`,
/// `###` plus whitespace) or a horizontal rule of `===`/`---`.
fn starts_section(chars: &[char], pos: usize) -> bool {
    let rest = &chars[pos.min(chars.len())..];

    let hashes = rest.iter().take_while(|&&c| c == '#').count();
    if (1..=3).contains(&hashes) && rest.get(hashes).is_some_and(|c| c.is_whitespace()) {
        return true;
    }

    for rule in ['=', '-'] {
        let run = rest.iter().take_while(|&&c| c == rule).count();
        if run >= 3 && rest.get(run).map_or(true, |&c| c == '\n') {
            return true;
        }
    }
    false
}
