//! Per-call driver.
//!
//! A call moves through `NotStarted -> Before -> Calling -> (After | Error)
//! -> Finally -> Done`. Hooks never change the outcome: the caller gets the
//! operation's response, or its error, exactly as the operation produced it.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::debug;

use crate::config::{EngineConfig, OrchestratorConfig};
use crate::executor::HookExecutor;
use crate::scope::{AfterEntry, BeforeEntry, ErrorEntry, FinallyEntry, ScopeRegistry, ScopeStore};
use crate::types::{CallContext, CallInput, CallOutput, CallResult};

/// The wrapped request/response operation.
///
/// Implemented by collaborators: it performs the real call and maps the
/// response into the normalized `CallOutput` view.
#[async_trait]
pub trait Operation: Send + Sync {
    type Response: Any + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Provider name recorded in the call context.
    fn provider(&self) -> &str;

    /// Perform the call with the (possibly hook-rewritten) input.
    async fn invoke(&self, input: &CallInput) -> Result<Self::Response, Self::Error>;

    /// Normalized view of a response.
    fn normalize<'r>(&self, response: &'r Self::Response) -> CallOutput<'r>;
}

/// Failure of the underlying call, as returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The operation's own error, untouched
    #[error(transparent)]
    Operation(E),

    /// The operation did not finish within the call timeout
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The call was cancelled through its `CancelSignal`
    #[error("Call was cancelled")]
    Cancelled,
}

impl<E> CallError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallError::Cancelled)
    }

    /// The operation's error, if that is what failed.
    pub fn operation(&self) -> Option<&E> {
        match self {
            CallError::Operation(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            CallError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Lifecycle phase of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    NotStarted,
    Before,
    Calling,
    After,
    Error,
    Finally,
    Done,
}

/// Shared handle that cancels in-flight calls.
///
/// A call cancelled while its operation is pending takes the error path
/// with `CallError::Cancelled`; its error and finally hooks still run.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Per-call options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Scopes to consult after the global one, in order
    pub scopes: Vec<String>,
    /// Timeout for the underlying operation only
    pub timeout: Option<Duration>,
    pub tags: Vec<String>,
    /// Seeds `CallContext::metadata`
    pub metadata: Map<String, Value>,
    pub parent_id: Option<String>,
    pub route: Option<String>,
    pub cancel: Option<CancelSignal>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, name: impl Into<String>) -> Self {
        self.scopes.push(name.into());
        self
    }

    pub fn scopes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn cancel_on(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }
}

/// Everything a traced call leaves behind.
#[derive(Debug)]
pub struct CallOutcome<R, E> {
    /// What the caller of `run` would have received
    pub result: Result<R, CallError<E>>,
    /// Input as the operation saw it, after before hooks
    pub input: CallInput,
    /// Context after every hook ran
    pub context: CallContext,
    pub elapsed_ms: f64,
}

/// Flattened hook lists for one call, global scope first.
#[derive(Default)]
struct HookLists {
    before: Vec<BeforeEntry>,
    after: Vec<AfterEntry>,
    error: Vec<ErrorEntry>,
    finally: Vec<FinallyEntry>,
}

impl HookLists {
    async fn collect(stores: &[Arc<ScopeStore>]) -> Self {
        let mut lists = Self::default();
        for store in stores {
            lists.before.extend(store.before_hooks().await);
            lists.after.extend(store.after_hooks().await);
            lists.error.extend(store.error_hooks().await);
            lists.finally.extend(store.finally_hooks().await);
        }
        lists
    }
}

/// Drives calls through the hook pipeline.
pub struct CallOrchestrator {
    registry: Arc<ScopeRegistry>,
    executor: Arc<HookExecutor>,
    config: OrchestratorConfig,
}

impl CallOrchestrator {
    /// Create an orchestrator over a registry with a default executor.
    pub fn new(registry: Arc<ScopeRegistry>) -> Self {
        Self {
            registry,
            executor: Arc::new(HookExecutor::new()),
            config: OrchestratorConfig::default(),
        }
    }

    /// Create from engine configuration.
    pub fn from_config(registry: Arc<ScopeRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            executor: Arc::new(HookExecutor::with_config(config.executor.clone())),
            config: config.orchestrator.clone(),
        }
    }

    /// Use a specific executor (e.g. one with an error sink).
    pub fn with_executor(mut self, executor: Arc<HookExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Set orchestrator configuration.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<ScopeRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<HookExecutor> {
        &self.executor
    }

    /// Run one call through the hook pipeline.
    pub async fn run<O>(
        &self,
        operation: &O,
        input: CallInput,
        options: CallOptions,
    ) -> Result<O::Response, CallError<O::Error>>
    where
        O: Operation + ?Sized,
    {
        self.run_traced(operation, input, options).await.result
    }

    /// Like [`run`](Self::run), also returning the final input and context.
    pub async fn run_traced<O>(
        &self,
        operation: &O,
        mut input: CallInput,
        options: CallOptions,
    ) -> CallOutcome<O::Response, O::Error>
    where
        O: Operation + ?Sized,
    {
        let started = Instant::now();
        let CallOptions {
            scopes,
            timeout,
            tags,
            metadata,
            parent_id,
            route,
            cancel,
        } = options;

        let mut ctx = CallContext::new(operation.provider(), input.model.clone())
            .with_tags(tags)
            .with_metadata(metadata);
        if let Some(parent_id) = parent_id {
            ctx = ctx.with_parent(parent_id);
        }
        if let Some(route) = route {
            ctx = ctx.with_route(route);
        }

        let stores = self.registry.resolve_for_client(&scopes);
        let hooks = HookLists::collect(&stores).await;

        phase(&ctx, CallPhase::Before);
        self.executor
            .run_before(&hooks.before, &mut input, &mut ctx)
            .await;

        phase(&ctx, CallPhase::Calling);
        let timeout = timeout.or_else(|| self.config.default_timeout());
        let outcome = invoke(operation, &input, timeout, cancel.as_ref()).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(response) => {
                phase(&ctx, CallPhase::After);
                let output = operation.normalize(&response);
                self.executor
                    .run_after(&hooks.after, &input, &output, &mut ctx)
                    .await;

                phase(&ctx, CallPhase::Finally);
                let summary = CallResult {
                    input: &input,
                    output: Some(&output),
                    context: &ctx,
                    error: None,
                    ended_at: Utc::now(),
                    elapsed_ms,
                };
                self.executor.run_finally(&hooks.finally, &summary).await;
                Ok(response)
            }
            Err(error) => {
                phase(&ctx, CallPhase::Error);
                debug!(call_id = %ctx.call_id(), error = %error, "Underlying call failed");
                self.executor
                    .run_error(&hooks.error, &input, &error, &mut ctx)
                    .await;

                phase(&ctx, CallPhase::Finally);
                let summary = CallResult {
                    input: &input,
                    output: None,
                    context: &ctx,
                    error: Some(&error),
                    ended_at: Utc::now(),
                    elapsed_ms,
                };
                self.executor.run_finally(&hooks.finally, &summary).await;
                Err(error)
            }
        };

        debug!(
            call_id = %ctx.call_id(),
            phase = ?CallPhase::Done,
            success = result.is_ok(),
            elapsed_ms,
            "Call complete"
        );

        CallOutcome {
            result,
            input,
            context: ctx,
            elapsed_ms,
        }
    }
}

fn phase(ctx: &CallContext, phase: CallPhase) {
    debug!(call_id = %ctx.call_id(), ?phase, "Entering phase");
}

/// Invoke the operation under the optional timeout and cancellation signal.
async fn invoke<O>(
    operation: &O,
    input: &CallInput,
    timeout: Option<Duration>,
    cancel: Option<&CancelSignal>,
) -> Result<O::Response, CallError<O::Error>>
where
    O: Operation + ?Sized,
{
    if cancel.is_some_and(CancelSignal::is_cancelled) {
        return Err(CallError::Cancelled);
    }

    let call = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, operation.invoke(input)).await {
                Ok(result) => result.map_err(CallError::Operation),
                Err(_elapsed) => Err(CallError::Timeout(limit)),
            },
            None => operation.invoke(input).await.map_err(CallError::Operation),
        }
    };

    match cancel {
        Some(signal) => tokio::select! {
            result = call => result,
            _ = signal.cancelled() => Err(CallError::Cancelled),
        },
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{after_fn, before_fn, error_fn, finally_fn, HookError};
    use crate::types::DynError;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_test::{assert_pending, assert_ready};

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("upstream said no")]
    struct Upstream;

    /// Echoes the model back, or fails, after an optional delay.
    struct Echo {
        fail: bool,
        delay: Duration,
    }

    impl Echo {
        fn ok() -> Self {
            Self {
                fail: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Operation for Echo {
        type Response = String;
        type Error = Upstream;

        fn provider(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, input: &CallInput) -> Result<String, Upstream> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Upstream);
            }
            Ok(format!("echo:{}", input.model))
        }

        fn normalize<'r>(&self, response: &'r String) -> CallOutput<'r> {
            CallOutput::from_raw(response).with_text(response.clone())
        }
    }

    fn log_hook_runs(log: &Arc<Mutex<Vec<String>>>, label: &str) -> impl Fn() + Send + Sync {
        let log = Arc::clone(log);
        let label = label.to_string();
        move || log.lock().unwrap().push(label.clone())
    }

    #[tokio::test]
    async fn test_success_path_order() {
        let registry = Arc::new(ScopeRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let global = registry.global_store();

        let hit = log_hook_runs(&log, "before");
        global
            .add(before_fn("b", move |_, _| { hit(); Ok(()) }), None)
            .await;
        let hit = log_hook_runs(&log, "after");
        global
            .add(after_fn("a", move |_, _, _| { hit(); Ok(()) }), None)
            .await;
        let hit = log_hook_runs(&log, "error");
        global
            .add(error_fn("e", move |_, _, _| { hit(); Ok(()) }), None)
            .await;
        let hit = log_hook_runs(&log, "finally");
        global
            .add(finally_fn("f", move |_| { hit(); Ok(()) }), None)
            .await;

        let orchestrator = CallOrchestrator::new(registry);
        let response = orchestrator
            .run(&Echo::ok(), CallInput::new("gpt-4"), CallOptions::new())
            .await
            .unwrap();

        assert_eq!(response, "echo:gpt-4");
        assert_eq!(*log.lock().unwrap(), ["before", "after", "finally"]);
    }

    #[tokio::test]
    async fn test_error_path_returns_original_error() {
        let registry = Arc::new(ScopeRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let global = registry.global_store();

        let hit = log_hook_runs(&log, "after");
        global
            .add(after_fn("a", move |_, _, _| { hit(); Ok(()) }), None)
            .await;
        let hit = log_hook_runs(&log, "error");
        global
            .add(
                error_fn("e", move |_, _, _| {
                    hit();
                    Err(HookError::failed("error hook itself fails"))
                }),
                None,
            )
            .await;
        let hit = log_hook_runs(&log, "finally");
        global
            .add(finally_fn("f", move |_| { hit(); Ok(()) }), None)
            .await;

        let orchestrator = CallOrchestrator::new(registry);
        let failing = Echo {
            fail: true,
            delay: Duration::ZERO,
        };
        let err = orchestrator
            .run(&failing, CallInput::new("gpt-4"), CallOptions::new())
            .await
            .unwrap_err();

        assert_eq!(err.operation(), Some(&Upstream));
        assert_eq!(*log.lock().unwrap(), ["error", "finally"]);
    }

    #[tokio::test]
    async fn test_before_hooks_rewrite_input() {
        let registry = Arc::new(ScopeRegistry::new());
        registry
            .get_or_create("routing")
            .add(
                before_fn("reroute", |input, ctx| {
                    input.model = "gpt-4o-mini".into();
                    ctx.metadata.insert("rerouted".into(), json!(true));
                    Ok(())
                }),
                None,
            )
            .await;

        let orchestrator = CallOrchestrator::new(registry);
        let outcome = orchestrator
            .run_traced(
                &Echo::ok(),
                CallInput::new("gpt-4"),
                CallOptions::new().scope("routing"),
            )
            .await;

        assert_eq!(outcome.result.unwrap(), "echo:gpt-4o-mini");
        assert_eq!(outcome.input.model, "gpt-4o-mini");
        assert_eq!(outcome.context.metadata["rerouted"], json!(true));
        // identity is fixed at call start
        assert_eq!(outcome.context.model(), "gpt-4");
        assert_eq!(outcome.context.provider(), "echo");
    }

    #[tokio::test]
    async fn test_context_built_from_options() {
        let registry = Arc::new(ScopeRegistry::new());
        let orchestrator = CallOrchestrator::new(registry);

        let outcome = orchestrator
            .run_traced(
                &Echo::ok(),
                CallInput::new("gpt-4"),
                CallOptions::new()
                    .tag("prod")
                    .metadata("user_id", "u-7")
                    .parent("call-0")
                    .route("completions"),
            )
            .await;

        assert!(outcome.result.is_ok());
        assert!(outcome.context.has_tag("prod"));
        assert_eq!(outcome.context.metadata["user_id"], json!("u-7"));
        assert_eq!(outcome.context.parent_id(), Some("call-0"));
        assert_eq!(outcome.context.route(), "completions");
        assert!(outcome.elapsed_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_default_timeout_from_config() {
        let registry = Arc::new(ScopeRegistry::new());
        let orchestrator = CallOrchestrator::new(registry).with_config(OrchestratorConfig {
            default_timeout_ms: Some(10),
        });
        let slow = Echo {
            fail: false,
            delay: Duration::from_secs(5),
        };

        let err = orchestrator
            .run(&slow, CallInput::new("gpt-4"), CallOptions::new())
            .await
            .unwrap_err();

        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_cancellation_takes_error_path() {
        let registry = Arc::new(ScopeRegistry::new());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let errors = Arc::clone(&seen);
        registry
            .global_store()
            .add(
                error_fn("observe", move |_, error: &DynError, _| {
                    errors.lock().unwrap().push(error.to_string());
                    Ok(())
                }),
                None,
            )
            .await;
        let finals = Arc::clone(&seen);
        registry
            .global_store()
            .add(
                finally_fn("final", move |result| {
                    finals
                        .lock()
                        .unwrap()
                        .push(format!("finally:{}", result.is_success()));
                    Ok(())
                }),
                None,
            )
            .await;

        let orchestrator = CallOrchestrator::new(registry);
        let signal = CancelSignal::new();
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let slow = Echo {
            fail: false,
            delay: Duration::from_secs(5),
        };
        let err = orchestrator
            .run(
                &slow,
                CallInput::new("gpt-4"),
                CallOptions::new().cancel_on(signal),
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(
            *seen.lock().unwrap(),
            ["Call was cancelled", "finally:false"]
        );
    }

    #[test]
    fn test_cancel_signal_wakes_waiter() {
        let signal = CancelSignal::new();
        let mut waiter = tokio_test::task::spawn(signal.cancelled());
        assert_pending!(waiter.poll());

        signal.cancel();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_operation() {
        let registry = Arc::new(ScopeRegistry::new());
        let orchestrator = CallOrchestrator::new(registry);
        let signal = CancelSignal::new();
        signal.cancel();

        let err = orchestrator
            .run(
                &Echo::ok(),
                CallInput::new("gpt-4"),
                CallOptions::new().cancel_on(signal),
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
    }
}
