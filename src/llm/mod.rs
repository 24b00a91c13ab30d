//! LLM integration module.
//!
//! Provides the [`ChatApi`] collaborator boundary, an OpenAI-compatible
//! client implementation, and the fixed prompts used by the pipeline.

mod client;
mod prompts;

pub use client::{
    CallError, ChatApi, ChatRequest, ContentPart, ImageSource, LlmClient, LlmResponse, Message,
    MessageContent, Role, TokenUsage,
};
pub use prompts::Prompts;
