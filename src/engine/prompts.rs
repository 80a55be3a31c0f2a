//! Prompt construction for chunk and stitch calls.

use crate::llm::ChatMessage;

/// Literal separator placed between chunk outputs for the stitch pass.
pub const CHUNK_BOUNDARY_MARKER: &str = "\n\n---CHUNK BOUNDARY---\n\n";

/// Where a chunk sits within the document, for the system message.
fn position_hint(index: u32, total: u32) -> String {
    match (index, total) {
        (_, 1) => "the complete text".to_string(),
        (0, n) => format!(
            "the beginning of a longer document (section 1 of {n}) — text may start mid-context"
        ),
        (i, n) if i == n - 1 => {
            format!("the end of a longer document (section {n} of {n}) — text may start mid-context")
        }
        (i, n) => format!(
            "section {} of {n} of a longer document — text may start and end mid-sentence",
            i + 1
        ),
    }
}

/// Build the two messages for one chunk call.
///
/// The user message bookends the instruction around the text: on very long
/// non-English bodies some providers drop early instructions from attention,
/// so the instruction is restated after the text.
pub fn chunk_messages(
    instruction: &str,
    chunk_text: &str,
    index: u32,
    total: u32,
) -> Vec<ChatMessage> {
    let system = format!(
        "You are a document processor. You are given {}.\n\
         Rules:\n\
         - Apply the user's instruction exactly to the text you are given.\n\
         - Do not add preambles, introductions, or closing remarks.\n\
         - Do not ask for more input; process what is present.\n\
         - If the instruction is a translation, output only the target \
           language — never echo the source language.\n\
         - Prefer direct quotation over paraphrase.\n\
         - Do not editorialize.",
        position_hint(index, total)
    );

    let user = format!(
        "Instruction: {instruction}\n\n\
         ---\n{chunk_text}\n---\n\n\
         Reminder — apply this instruction to the text above: {instruction}"
    );

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// Build the messages for the seam-smoothing stitch pass.
pub fn stitch_messages(instruction: &str, joined_outputs: &str) -> Vec<ChatMessage> {
    let system = format!(
        "You are assembling the output of a document processed in sections.\n\
         The original instruction was: {instruction}\n\
         The sections below are joined by the literal marker \
         \"---CHUNK BOUNDARY---\".\n\
         Smooth the transitions and remove redundancies at the boundaries \
         only. Reproduce everything else verbatim. Do not summarize, \
         shorten, or truncate any part of the text."
    );

    vec![
        ChatMessage::system(system),
        ChatMessage::user(joined_outputs.to_string()),
    ]
}
