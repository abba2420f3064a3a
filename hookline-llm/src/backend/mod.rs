//! LLM Backend abstraction layer.
//!
//! Provides a trait-based interface for LLM inference backends plus a mock
//! backend for testing.

pub mod mock;
pub mod traits;

pub use mock::MockBackend;
pub use traits::{
    CompletionRequest, CompletionResponse, FinishReason, LlmBackend, LlmError, Message,
    MessageRole, ModelCapabilities, Usage,
};
