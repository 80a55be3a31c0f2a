//! LLM provider abstraction.

pub mod catalog;
pub mod provider;

pub use catalog::{HttpCatalog, ModelDirectory, ModelInfo, StaticCatalog};
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, HttpProvider, LlmProvider, Usage,
};
