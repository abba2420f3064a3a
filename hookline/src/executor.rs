//! Hook execution with per-invocation failure isolation.
//!
//! Every hook call runs inside its own boundary: an `Err`, a panic or an
//! overrun of the per-hook timeout is logged, handed to the optional sink
//! and dropped. The next hook in the list always runs.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::hook::{panic_message, HookError, HookKind};
use crate::rule::Rule;
use crate::scope::{AfterEntry, BeforeEntry, ErrorEntry, FinallyEntry};
use crate::types::{CallContext, CallInput, CallOutput, CallResult, DynError};

/// Receives hook and rule failures.
///
/// The label names the stage and hook, e.g. "After hook audit". A sink that
/// panics is itself isolated.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &HookError, context: &str);
}

impl<F> ErrorSink for F
where
    F: Fn(&HookError, &str) + Send + Sync,
{
    fn report(&self, error: &HookError, context: &str) {
        self(error, context)
    }
}

/// Runs flattened hook lists against one call's data.
pub struct HookExecutor {
    config: ExecutorConfig,
    sink: Option<Arc<dyn ErrorSink>>,
}

impl HookExecutor {
    /// Create an executor with default configuration and no sink.
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(config: ExecutorConfig) -> Self {
        Self { config, sink: None }
    }

    /// Attach a failure sink.
    pub fn with_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run before hooks. They may rewrite `input` for the underlying call.
    pub async fn run_before(
        &self,
        entries: &[BeforeEntry],
        input: &mut CallInput,
        ctx: &mut CallContext,
    ) {
        for entry in entries {
            let name = entry.hook.name();
            if !self.gate(HookKind::Before, name, entry.rule.as_ref(), input, ctx) {
                continue;
            }
            let call_id = ctx.call_id().to_string();
            let invocation = entry.hook.before(input, ctx);
            self.isolate(HookKind::Before, name, &call_id, invocation)
                .await;
        }
    }

    /// Run after hooks for a successful call.
    pub async fn run_after(
        &self,
        entries: &[AfterEntry],
        input: &CallInput,
        output: &CallOutput<'_>,
        ctx: &mut CallContext,
    ) {
        for entry in entries {
            let name = entry.hook.name();
            if !self.gate(HookKind::After, name, entry.rule.as_ref(), input, ctx) {
                continue;
            }
            let call_id = ctx.call_id().to_string();
            let invocation = entry.hook.after(input, output, ctx);
            self.isolate(HookKind::After, name, &call_id, invocation)
                .await;
        }
    }

    /// Run error hooks for a failed call.
    ///
    /// Hooks only observe `error`; the caller still receives it afterwards.
    pub async fn run_error(
        &self,
        entries: &[ErrorEntry],
        input: &CallInput,
        error: &DynError,
        ctx: &mut CallContext,
    ) {
        for entry in entries {
            let name = entry.hook.name();
            if !self.gate(HookKind::Error, name, entry.rule.as_ref(), input, ctx) {
                continue;
            }
            let call_id = ctx.call_id().to_string();
            let invocation = entry.hook.on_error(input, error, ctx);
            self.isolate(HookKind::Error, name, &call_id, invocation)
                .await;
        }
    }

    /// Run every finally hook. Rules are not consulted.
    pub async fn run_finally(&self, entries: &[FinallyEntry], result: &CallResult<'_>) {
        let call_id = result.context.call_id();
        for entry in entries {
            let name = entry.hook.name();
            self.isolate(HookKind::Finally, name, call_id, entry.hook.finally(result))
                .await;
        }
    }

    /// Decide whether a hook runs. A failing rule is reported and skips the hook.
    fn gate(
        &self,
        kind: HookKind,
        hook: &str,
        rule: Option<&Rule>,
        input: &CallInput,
        ctx: &CallContext,
    ) -> bool {
        let Some(rule) = rule else {
            return true;
        };

        match rule.try_matches(input, ctx) {
            Ok(true) => true,
            Ok(false) => {
                debug!(call_id = %ctx.call_id(), stage = %kind, hook, rule = %rule, "Rule did not match");
                false
            }
            Err(error) => {
                let label = format!("{} rule", kind.label(hook));
                self.report(&label, ctx.call_id(), &error);
                false
            }
        }
    }

    /// Await one hook invocation, converting any failure into a report.
    async fn isolate<F>(&self, kind: HookKind, hook: &str, call_id: &str, invocation: F)
    where
        F: Future<Output = Result<(), HookError>>,
    {
        let guarded = AssertUnwindSafe(invocation).catch_unwind();

        let outcome = match self.config.hook_timeout() {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Ok(Err(HookError::Timeout(limit))),
            },
            None => guarded.await,
        };

        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error,
            Err(payload) => HookError::Panicked(panic_message(payload.as_ref())),
        };

        self.report(&kind.label(hook), call_id, &error);
    }

    fn report(&self, label: &str, call_id: &str, error: &HookError) {
        if self.config.log_failures {
            warn!(call_id, error = %error, "{} failed", label);
        }

        if let Some(sink) = &self.sink {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink.report(error, label))) {
                warn!(
                    call_id,
                    "Error sink panicked while reporting {}: {}",
                    label,
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl Default for HookExecutor {
    fn default() -> Self {
        Self::new()
    }
}
