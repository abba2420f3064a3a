//! Hookline LLM - Hooked LLM Backends
//!
//! Provides:
//! - The trait-based `LlmBackend` abstraction and its request/response types
//! - A configurable mock backend for tests
//! - `HookedBackend`, which runs every completion through hookline scopes
//! - `EvaluationHook`, an after hook that grades responses with a second backend
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            HookedBackend                │
//! │   (is an LlmBackend, wraps another)     │
//! └────────────────┬────────────────────────┘
//!                  │
//!      ┌───────────┴───────────┐
//!      ▼                       ▼
//! ┌─────────────┐       ┌─────────────┐
//! │CallOrchestr-│       │ LlmBackend  │
//! │ator (hooks) │──────▶│ (inner)     │
//! └─────────────┘       └─────────────┘
//! ```

pub mod backend;
pub mod evaluation;
pub mod hooked;

// Re-export main types for convenience
pub use backend::{
    CompletionRequest, CompletionResponse, FinishReason, LlmBackend, LlmError, Message,
    MessageRole, MockBackend, ModelCapabilities, Usage,
};
pub use evaluation::{EvaluationHook, DEFAULT_EVALUATION_KEY};
pub use hooked::HookedBackend;
