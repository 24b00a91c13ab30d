//! OpenAI-compatible LLM client.
//!
//! This client works with any OpenAI-compatible chat-completions endpoint,
//! including local proxies that front multiple providers. The [`ChatApi`]
//! trait is the seam the evaluator and judge depend on, so tests can swap
//! in scripted doubles without a network.

use crate::config::LlmConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Message role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Image payload referenced from a content part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    pub url: String,
}

/// One part of a multimodal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageSource },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageSource { url: url.into() },
        }
    }
}

/// Message content: a plain string for text-only turns, or a list of
/// parts for vision turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    /// User turn built from multimodal parts.
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

/// A single chat call: model, conversation, and per-attempt limits.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Failure classes a chat call can surface.
///
/// The retry policy branches on this: transient transport errors are
/// retryable, a received-but-not-OK HTTP response is not (except 429,
/// which the policy treats as rate limiting).
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// An HTTP response arrived but was not OK.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never produced an HTTP response.
    #[error("transport error: {message}")]
    Transport { message: String, transient: bool },
}

impl CallError {
    /// Whether this is a timeout/connection-class failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::Transport {
                transient: true,
                ..
            }
        )
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        CallError::Transport {
            transient: err.is_timeout() || err.is_connect(),
            message: err.to_string(),
        }
    }
}

/// Response from an LLM call including metadata.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The generated content.
    pub content: String,
    /// Reason the model stopped generating.
    pub finish_reason: Option<String>,
    /// Token usage (if available).
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Model-call collaborator boundary.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> std::result::Result<LlmResponse, CallError>;
}

/// Request body for chat completion.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

/// Response from chat completion.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// OpenAI-compatible LLM client.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    /// Create a new LLM client with the given configuration.
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Get the API endpoint URL.
    fn endpoint(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        format!("{}/v1/chat/completions", base)
    }

    /// Test connectivity to the API with a trivial prompt.
    pub async fn test_connection(&self, model: &str) -> crate::error::Result<()> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![Message::user("Say 'hello' and nothing else.")],
            max_tokens: 16,
            temperature: 0.0,
            timeout: Duration::from_secs(30),
        };

        let response = self
            .chat(request)
            .await
            .map_err(|e| crate::error::EvalError::LlmApi(e.to_string()))?;

        if response.content.to_lowercase().contains("hello") {
            Ok(())
        } else {
            Err(crate::error::EvalError::LlmApi(format!(
                "Unexpected response: {}",
                response.content
            )))
        }
    }
}

#[async_trait]
impl ChatApi for LlmClient {
    async fn chat(&self, request: ChatRequest) -> std::result::Result<LlmResponse, CallError> {
        let body = ChatCompletionRequest {
            model: request.model,
            messages: request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(CallError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(CallError::from_reqwest)?;

        if !status.is_success() {
            return Err(CallError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let completion: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| CallError::Transport {
                message: format!("invalid response body: {}", e),
                transient: false,
            })?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CallError::Transport {
                message: "no choices in response".to_string(),
                transient: false,
            })?;

        Ok(LlmResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            usage: completion.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }
}
