//! The `LlmBackend` trait and the completion types it speaks.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors a completion can fail with.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Request or response could not be (de)serialized
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("Completion cancelled")]
    Cancelled,
}

/// An inference engine that turns a request into one completion.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend identifier, usually its default model.
    fn id(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    fn capabilities(&self) -> &ModelCapabilities;
}

/// Request for LLM completion.
///
/// Serializes flat: every field except `model` and `messages` becomes a
/// call parameter that before hooks can rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionRequest {
    /// Model to use; the backend's own model when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    /// 0.0-2.0
    pub temperature: Option<f32>,
    pub stop_sequences: Vec<String>,
    /// Ask for a JSON object instead of free text
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_output: bool,
}

impl CompletionRequest {
    /// Request with a single user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(content)],
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set temperature, clamped to 0.0-2.0.
    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp.clamp(0.0, 2.0));
        self
    }

    pub fn with_stop(mut self, sequence: impl Into<String>) -> Self {
        self.stop_sequences.push(sequence.into());
        self
    }

    pub fn with_json_output(mut self) -> Self {
        self.json_output = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Hit `max_tokens`
    Length,
    ContentFilter,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
        }
    }
}

/// Token counts reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    /// Prompt plus completion tokens. Widened so it cannot overflow.
    pub fn total(&self) -> u64 {
        u64::from(self.prompt_tokens) + u64::from(self.completion_tokens)
    }
}

/// What a backend can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub max_output_tokens: u32,
    /// Honors `CompletionRequest::json_output`
    pub supports_json_mode: bool,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            max_output_tokens: 1024,
            supports_json_mode: false,
        }
    }
}
