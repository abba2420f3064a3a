//! Hook kinds, hook traits and registration entries.
//!
//! Each lifecycle point has its own trait with a fixed signature. `Hook` is
//! the closed set of those four, which is what a scope store holds.

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::rule::Rule;
use crate::types::{CallContext, CallInput, CallOutput, CallResult, DynError};

/// Lifecycle point a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    /// Before the underlying call
    Before,
    /// After a successful call
    After,
    /// After a failed call
    Error,
    /// After every call, success or not
    Finally,
}

impl HookKind {
    pub const ALL: [HookKind; 4] = [
        HookKind::Before,
        HookKind::After,
        HookKind::Error,
        HookKind::Finally,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Before => "before",
            HookKind::After => "after",
            HookKind::Error => "error",
            HookKind::Finally => "finally",
        }
    }

    /// Label used when reporting a failed hook, e.g. "After hook audit".
    pub(crate) fn label(&self, hook_name: &str) -> String {
        let stage = match self {
            HookKind::Before => "Before",
            HookKind::After => "After",
            HookKind::Error => "Error",
            HookKind::Finally => "Finally",
        };
        format!("{stage} hook {hook_name}")
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "before" => Ok(HookKind::Before),
            "after" => Ok(HookKind::After),
            "error" => Ok(HookKind::Error),
            "finally" | "finally_" => Ok(HookKind::Finally),
            _ => Err(ConfigError::UnknownHookKind(s.to_string())),
        }
    }
}

/// Failure raised by a hook or a rule.
///
/// Never leaves the executor: it is logged, reported to the sink and dropped.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Hook reported a failure
    #[error("Hook failed: {0}")]
    Failed(String),

    /// Hook or rule predicate panicked
    #[error("Hook panicked: {0}")]
    Panicked(String),

    /// Hook ran past the executor's per-hook timeout
    #[error("Hook timed out after {0:?}")]
    Timeout(Duration),

    /// Rule evaluation failed
    #[error("Rule {rule} failed: {reason}")]
    Rule { rule: String, reason: String },

    /// Any other error raised inside a hook
    #[error(transparent)]
    Other(Box<DynError>),
}

impl HookError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HookError::Failed(reason.into())
    }

    pub fn other(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        HookError::Other(Box::new(error))
    }
}

impl From<serde_json::Error> for HookError {
    fn from(error: serde_json::Error) -> Self {
        HookError::other(error)
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs before the underlying call and may rewrite its input.
#[async_trait]
pub trait BeforeHook: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn before(&self, input: &mut CallInput, ctx: &mut CallContext) -> Result<(), HookError>;
}

/// Runs after a successful call.
#[async_trait]
pub trait AfterHook: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn after(
        &self,
        input: &CallInput,
        output: &CallOutput<'_>,
        ctx: &mut CallContext,
    ) -> Result<(), HookError>;
}

/// Observes a failed call. The error is returned to the caller regardless.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn on_error(
        &self,
        input: &CallInput,
        error: &DynError,
        ctx: &mut CallContext,
    ) -> Result<(), HookError>;
}

/// Runs once at the end of every call.
#[async_trait]
pub trait FinallyHook: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn finally(&self, result: &CallResult<'_>) -> Result<(), HookError>;
}

/// A hook of any kind.
#[derive(Clone)]
pub enum Hook {
    Before(Arc<dyn BeforeHook>),
    After(Arc<dyn AfterHook>),
    Error(Arc<dyn ErrorHook>),
    Finally(Arc<dyn FinallyHook>),
}

impl Hook {
    pub fn before(hook: impl BeforeHook + 'static) -> Self {
        Hook::Before(Arc::new(hook))
    }

    pub fn after(hook: impl AfterHook + 'static) -> Self {
        Hook::After(Arc::new(hook))
    }

    pub fn error(hook: impl ErrorHook + 'static) -> Self {
        Hook::Error(Arc::new(hook))
    }

    pub fn finally(hook: impl FinallyHook + 'static) -> Self {
        Hook::Finally(Arc::new(hook))
    }

    /// The lifecycle point this hook belongs to.
    pub fn kind(&self) -> HookKind {
        match self {
            Hook::Before(_) => HookKind::Before,
            Hook::After(_) => HookKind::After,
            Hook::Error(_) => HookKind::Error,
            Hook::Finally(_) => HookKind::Finally,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Hook::Before(h) => h.name(),
            Hook::After(h) => h.name(),
            Hook::Error(h) => h.name(),
            Hook::Finally(h) => h.name(),
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// A hook paired with the rule that gates it.
#[derive(Debug, Clone)]
pub struct Registration<H> {
    pub hook: H,
    pub rule: Option<Rule>,
}

impl<H> Registration<H> {
    pub fn new(hook: H, rule: Option<Rule>) -> Self {
        Self { hook, rule }
    }
}

/// Closure-backed hook.
///
/// Build one with [`before_fn`], [`after_fn`], [`error_fn`] or
/// [`finally_fn`]. The closure runs synchronously inside the hook's
/// invocation.
pub struct FnHook<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> BeforeHook for FnHook<F>
where
    F: Fn(&mut CallInput, &mut CallContext) -> Result<(), HookError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn before(&self, input: &mut CallInput, ctx: &mut CallContext) -> Result<(), HookError> {
        (self.f)(input, ctx)
    }
}

#[async_trait]
impl<F> AfterHook for FnHook<F>
where
    F: Fn(&CallInput, &CallOutput<'_>, &mut CallContext) -> Result<(), HookError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn after(
        &self,
        input: &CallInput,
        output: &CallOutput<'_>,
        ctx: &mut CallContext,
    ) -> Result<(), HookError> {
        (self.f)(input, output, ctx)
    }
}

#[async_trait]
impl<F> ErrorHook for FnHook<F>
where
    F: Fn(&CallInput, &DynError, &mut CallContext) -> Result<(), HookError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_error(
        &self,
        input: &CallInput,
        error: &DynError,
        ctx: &mut CallContext,
    ) -> Result<(), HookError> {
        (self.f)(input, error, ctx)
    }
}

#[async_trait]
impl<F> FinallyHook for FnHook<F>
where
    F: Fn(&CallResult<'_>) -> Result<(), HookError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn finally(&self, result: &CallResult<'_>) -> Result<(), HookError> {
        (self.f)(result)
    }
}

/// Before hook from a closure.
pub fn before_fn<F>(name: impl Into<String>, f: F) -> Hook
where
    F: Fn(&mut CallInput, &mut CallContext) -> Result<(), HookError> + Send + Sync + 'static,
{
    Hook::before(FnHook {
        name: name.into(),
        f,
    })
}

/// After hook from a closure.
pub fn after_fn<F>(name: impl Into<String>, f: F) -> Hook
where
    F: Fn(&CallInput, &CallOutput<'_>, &mut CallContext) -> Result<(), HookError>
        + Send
        + Sync
        + 'static,
{
    Hook::after(FnHook {
        name: name.into(),
        f,
    })
}

/// Error hook from a closure.
pub fn error_fn<F>(name: impl Into<String>, f: F) -> Hook
where
    F: Fn(&CallInput, &DynError, &mut CallContext) -> Result<(), HookError>
        + Send
        + Sync
        + 'static,
{
    Hook::error(FnHook {
        name: name.into(),
        f,
    })
}

/// Finally hook from a closure.
pub fn finally_fn<F>(name: impl Into<String>, f: F) -> Hook
where
    F: Fn(&CallResult<'_>) -> Result<(), HookError> + Send + Sync + 'static,
{
    Hook::finally(FnHook {
        name: name.into(),
        f,
    })
}
