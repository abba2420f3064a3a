//! Hookline - Scoped Lifecycle Hooks for Request/Response Calls
//!
//! Wraps an outbound call (typically an LLM completion) with four kinds of
//! hooks:
//! - **before** hooks may rewrite the input and annotate the context
//! - **after** hooks observe a successful response
//! - **error** hooks observe a failure
//! - **finally** hooks see the terminal summary of every call
//!
//! Hooks live in named scopes; every call consults the global scope plus the
//! scopes it asks for. Each registration may carry a [`Rule`] deciding per
//! call whether the hook applies. A failing hook is logged and reported but
//! never changes what the caller gets back.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          CallOrchestrator               │
//! │  (before → call → after|error → finally)│
//! └────────────────┬────────────────────────┘
//!                  │
//!      ┌───────────┴───────────┐
//!      ▼                       ▼
//! ┌─────────────┐       ┌─────────────┐
//! │ScopeRegistry│       │HookExecutor │
//! │ global +    │       │ rule gating │
//! │ named stores│       │ + isolation │
//! └─────────────┘       └─────────────┘
//! ```

pub mod config;
pub mod executor;
pub mod global;
pub mod hook;
pub mod metrics;
pub mod orchestrator;
pub mod rule;
pub mod scope;
pub mod types;

// Re-export main types for convenience
pub use config::{
    ConfigError, EngineConfig, ExecutorConfig, HookCatalog, HooksConfig, OrchestratorConfig,
};
pub use executor::{ErrorSink, HookExecutor};
pub use global::{default_registry, global_scope, scope};
pub use hook::{
    after_fn, before_fn, error_fn, finally_fn, AfterHook, BeforeHook, ErrorHook, FinallyHook,
    Hook, HookError, HookKind, Registration,
};
pub use metrics::{MetricsHook, MetricsSummary};
pub use orchestrator::{
    CallError, CallOptions, CallOrchestrator, CallOutcome, CallPhase, CancelSignal, Operation,
};
pub use rule::Rule;
pub use scope::{ScopeRegistry, ScopeStore, GLOBAL_SCOPE};
pub use types::*;
