//! Hook-wrapped LLM backend.
//!
//! `HookedBackend` is itself an `LlmBackend`, so it drops in wherever the
//! inner backend was used. Each completion runs through a
//! `CallOrchestrator`: before hooks see the request as a `CallInput`, and
//! whatever they leave behind is what the inner backend receives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hookline::{CallError, CallInput, CallOptions, CallOrchestrator, CallOutput, Operation};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::backend::{CompletionRequest, CompletionResponse, LlmBackend, LlmError, ModelCapabilities};

/// Backend wrapper that runs completions through the hook pipeline.
pub struct HookedBackend<B> {
    inner: B,
    orchestrator: Arc<CallOrchestrator>,
    scopes: Vec<String>,
    timeout: Option<Duration>,
}

impl<B: LlmBackend> HookedBackend<B> {
    /// Wrap `inner`, consulting only the global scope by default.
    pub fn new(inner: B, orchestrator: Arc<CallOrchestrator>) -> Self {
        Self {
            inner,
            orchestrator,
            scopes: Vec::new(),
            timeout: None,
        }
    }

    /// Consult this scope on every completion.
    pub fn with_scope(mut self, name: impl Into<String>) -> Self {
        self.scopes.push(name.into());
        self
    }

    /// Consult these scopes on every completion, in order.
    pub fn with_scopes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes.extend(names.into_iter().map(Into::into));
        self
    }

    /// Default timeout for completions that don't set their own.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    /// Complete with per-call options (extra scopes, tags, metadata,
    /// timeout, cancellation).
    ///
    /// The wrapper's own scopes come first, followed by `options.scopes`.
    /// `options.metadata` is visible both on the input and on the context.
    pub async fn complete_with(
        &self,
        request: CompletionRequest,
        mut options: CallOptions,
    ) -> Result<CompletionResponse, LlmError> {
        let mut input = to_call_input(&request, self.inner.id())?;
        input.metadata.extend(options.metadata.clone());
        let implied_model = request.model.is_none().then(|| input.model.clone());

        let mut scopes = self.scopes.clone();
        scopes.append(&mut options.scopes);
        options.scopes = scopes;
        if options.timeout.is_none() {
            options.timeout = self.timeout;
        }

        debug!(
            backend = %self.inner.id(),
            model = %input.model,
            scopes = ?options.scopes,
            "Hooked completion"
        );

        let call = BackendCall {
            backend: &self.inner,
            implied_model,
        };
        self.orchestrator
            .run(&call, input, options)
            .await
            .map_err(into_llm_error)
    }
}

#[async_trait]
impl<B: LlmBackend> LlmBackend for HookedBackend<B> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.complete_with(request, CallOptions::default()).await
    }

    fn capabilities(&self) -> &ModelCapabilities {
        self.inner.capabilities()
    }
}

/// One completion against the inner backend.
struct BackendCall<'a, B: ?Sized> {
    backend: &'a B,
    /// Model filled in from the backend id because the request had none
    implied_model: Option<String>,
}

#[async_trait]
impl<B: LlmBackend + ?Sized> Operation for BackendCall<'_, B> {
    type Response = CompletionResponse;
    type Error = LlmError;

    fn provider(&self) -> &str {
        self.backend.id()
    }

    async fn invoke(&self, input: &CallInput) -> Result<CompletionResponse, LlmError> {
        let mut request = from_call_input(input)?;
        if self.implied_model.as_deref() == Some(input.model.as_str()) {
            request.model = None;
        }
        self.backend.complete(request).await
    }

    fn normalize<'r>(&self, response: &'r CompletionResponse) -> CallOutput<'r> {
        let mut usage = Map::new();
        usage.insert("prompt_tokens".into(), json!(response.usage.prompt_tokens));
        usage.insert(
            "completion_tokens".into(),
            json!(response.usage.completion_tokens),
        );
        usage.insert("total_tokens".into(), json!(response.usage.total()));

        CallOutput::from_raw(response)
            .with_text(response.content.clone())
            .with_usage(usage)
            .with_finish_reason(response.finish_reason.as_str())
    }
}

fn parse_error(error: serde_json::Error) -> LlmError {
    LlmError::ParseError(error.to_string())
}

/// Request -> input. Every field besides `model` and `messages` becomes a param.
fn to_call_input(request: &CompletionRequest, default_model: &str) -> Result<CallInput, LlmError> {
    let Value::Object(mut params) = serde_json::to_value(request).map_err(parse_error)? else {
        return Err(LlmError::ParseError(
            "Completion request did not serialize to an object".to_string(),
        ));
    };

    let messages = params.remove("messages").unwrap_or_else(|| json!([]));
    params.remove("model");
    params.retain(|_, value| !value.is_null());

    Ok(CallInput {
        model: request
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        messages: serde_json::from_value(messages).map_err(parse_error)?,
        params,
        metadata: Map::new(),
    })
}

/// Input -> request, after before hooks had their turn.
fn from_call_input(input: &CallInput) -> Result<CompletionRequest, LlmError> {
    let mut fields = input.params.clone();
    fields.insert("model".into(), Value::String(input.model.clone()));
    fields.insert(
        "messages".into(),
        serde_json::to_value(&input.messages).map_err(parse_error)?,
    );
    serde_json::from_value(Value::Object(fields)).map_err(parse_error)
}

fn into_llm_error(error: CallError<LlmError>) -> LlmError {
    match error {
        CallError::Operation(error) => error,
        CallError::Timeout(limit) => LlmError::Timeout(limit),
        CallError::Cancelled => LlmError::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Message, MockBackend};
    use hookline::{
        after_fn, before_fn, error_fn, CancelSignal, DynError, HookError, Rule, ScopeRegistry,
    };
    use std::sync::Mutex;
    use tokio_test::assert_ok;

    fn orchestrator(registry: &Arc<ScopeRegistry>) -> Arc<CallOrchestrator> {
        Arc::new(CallOrchestrator::new(Arc::clone(registry)))
    }

    #[test]
    fn test_request_becomes_input() {
        let request = CompletionRequest::user("Hi")
            .with_system("Be brief")
            .with_temperature(0.5);

        let input = to_call_input(&request, "mock-model").unwrap();
        assert_eq!(input.model, "mock-model");
        assert_eq!(input.messages, [hookline::Message::user("Hi")]);
        assert_eq!(input.params["system_prompt"], json!("Be brief"));
        assert_eq!(input.params["temperature"], json!(0.5));
        assert!(!input.params.contains_key("max_tokens"));

        let rebuilt = from_call_input(&input).unwrap();
        assert_eq!(rebuilt, request.with_model("mock-model"));
    }

    #[tokio::test]
    async fn test_before_hook_rewrites_request() {
        let registry = Arc::new(ScopeRegistry::new());
        registry
            .global_store()
            .add(
                before_fn("route-cheap", |input, _| {
                    input.model = "gpt-4o-mini".into();
                    input.params.insert("max_tokens".into(), json!(32));
                    input
                        .messages
                        .insert(0, hookline::Message::system("Answer in one line"));
                    Ok(())
                }),
                None,
            )
            .await;

        let backend = HookedBackend::new(MockBackend::new("gpt-4"), orchestrator(&registry));
        backend
            .complete(CompletionRequest::user("Hi"))
            .await
            .unwrap();

        let seen = backend.inner().last_request().await.unwrap();
        assert_eq!(seen.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(seen.max_tokens, Some(32));
        assert_eq!(seen.messages[0], Message::system("Answer in one line"));
        assert_eq!(seen.messages[1], Message::user("Hi"));
    }

    #[tokio::test]
    async fn test_after_hook_sees_normalized_output() {
        let registry = Arc::new(ScopeRegistry::new());
        let seen = Arc::new(Mutex::new(None));
        let hook_seen = Arc::clone(&seen);
        registry
            .global_store()
            .add(
                after_fn("usage", move |_, output, _| {
                    let raw = output
                        .raw_as::<CompletionResponse>()
                        .ok_or_else(|| HookError::failed("unexpected raw response"))?;
                    *hook_seen.lock().unwrap() = Some((
                        output.text.clone(),
                        output.usage_u64("total_tokens"),
                        output.finish_reason.clone(),
                        raw.usage.total(),
                    ));
                    Ok(())
                }),
                None,
            )
            .await;

        let backend = HookedBackend::new(
            MockBackend::new("gpt-4").with_response("Hello there!"),
            orchestrator(&registry),
        );
        let response = backend
            .complete(CompletionRequest::user("Hi, how are you?"))
            .await
            .unwrap();

        let total = response.usage.total();
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some((
                Some("Hello there!".to_string()),
                Some(total),
                Some("stop".to_string()),
                response.usage.total(),
            ))
        );
    }

    #[tokio::test]
    async fn test_backend_error_passes_through() {
        let registry = Arc::new(ScopeRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        registry
            .global_store()
            .add(
                error_fn("watch", move |_, error: &DynError, _| {
                    hook_seen.lock().unwrap().push(error.to_string());
                    Ok(())
                }),
                None,
            )
            .await;

        let backend = HookedBackend::new(
            MockBackend::new("gpt-4").with_failure("upstream 500"),
            orchestrator(&registry),
        );
        let err = backend
            .complete(CompletionRequest::user("Hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::RequestFailed(ref r) if r == "upstream 500"));
        assert_eq!(*seen.lock().unwrap(), ["Request failed: upstream 500"]);
    }

    #[tokio::test]
    async fn test_timeout_and_cancellation_map_to_llm_errors() {
        let registry = Arc::new(ScopeRegistry::new());
        let backend = HookedBackend::new(
            MockBackend::new("gpt-4").with_delay(Duration::from_secs(30)),
            orchestrator(&registry),
        )
        .with_timeout(Duration::from_millis(10));

        let err = backend
            .complete(CompletionRequest::user("Hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(d) if d == Duration::from_millis(10)));

        let signal = CancelSignal::new();
        signal.cancel();
        let err = backend
            .complete_with(
                CompletionRequest::user("Hi"),
                CallOptions::new().cancel_on(signal),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_default_scopes_and_call_tags() {
        let registry = Arc::new(ScopeRegistry::new());
        registry
            .get_or_create("eval")
            .add(
                before_fn("eval-temp", |input, _| {
                    input.params.insert("temperature".into(), json!(0.0));
                    Ok(())
                }),
                Some(Rule::tag("deterministic")),
            )
            .await;

        let backend = HookedBackend::new(MockBackend::new("gpt-4"), orchestrator(&registry))
            .with_scope("eval");

        backend
            .complete(CompletionRequest::user("Hi").with_temperature(0.9))
            .await
            .unwrap();
        assert_eq!(
            backend.inner().last_request().await.unwrap().temperature,
            Some(0.9)
        );

        backend
            .complete_with(
                CompletionRequest::user("Hi").with_temperature(0.9),
                CallOptions::new().tag("deterministic"),
            )
            .await
            .unwrap();
        assert_eq!(
            backend.inner().last_request().await.unwrap().temperature,
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_bad_rewrite_is_an_operation_error() {
        let registry = Arc::new(ScopeRegistry::new());
        registry
            .global_store()
            .add(
                before_fn("bad-role", |input, _| {
                    input.messages.push(hookline::Message::new("tool", "{}"));
                    Ok(())
                }),
                None,
            )
            .await;

        let backend = HookedBackend::new(MockBackend::new("gpt-4"), orchestrator(&registry));
        let err = backend
            .complete(CompletionRequest::user("Hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::ParseError(_)));
        assert_eq!(backend.inner().call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_hooks_passes_request_through() {
        let registry = Arc::new(ScopeRegistry::new());
        let backend = HookedBackend::new(MockBackend::new("gpt-4"), orchestrator(&registry));

        let request = CompletionRequest::user("hi")
            .with_temperature(0.7)
            .with_max_tokens(16)
            .with_stop("END");
        assert_ok!(backend.complete(request.clone()).await);
        assert_eq!(backend.inner().last_request().await, Some(request));

        let pinned = CompletionRequest::user("hi").with_model("gpt-4o");
        assert_ok!(backend.complete(pinned.clone()).await);
        assert_eq!(backend.inner().last_request().await, Some(pinned));
    }

    #[tokio::test]
    async fn test_call_metadata_reaches_input_and_context() {
        let registry = Arc::new(ScopeRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        registry
            .global_store()
            .add(
                before_fn("who", move |input, ctx| {
                    hook_seen.lock().unwrap().push((
                        input.metadata.get("user_id").cloned(),
                        ctx.metadata.get("user_id").cloned(),
                    ));
                    Ok(())
                }),
                Some(Rule::metadata("user_id", "u-1")),
            )
            .await;

        let backend = HookedBackend::new(MockBackend::new("gpt-4"), orchestrator(&registry));
        assert_ok!(
            backend
                .complete_with(
                    CompletionRequest::user("Hi"),
                    CallOptions::new().metadata("user_id", "u-1"),
                )
                .await
        );

        assert_eq!(
            *seen.lock().unwrap(),
            [(Some(json!("u-1")), Some(json!("u-1")))]
        );
    }

    /// Reports more tokens than fit in a `u32` sum.
    struct Huge;

    #[async_trait]
    impl LlmBackend for Huge {
        fn id(&self) -> &str {
            "huge"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn complete(&self, _: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: "ok".into(),
                finish_reason: crate::backend::FinishReason::Stop,
                usage: crate::backend::Usage {
                    prompt_tokens: u32::MAX,
                    completion_tokens: 1,
                },
            })
        }

        fn capabilities(&self) -> &ModelCapabilities {
            static CAPS: std::sync::OnceLock<ModelCapabilities> = std::sync::OnceLock::new();
            CAPS.get_or_init(ModelCapabilities::default)
        }
    }

    #[tokio::test]
    async fn test_large_usage_is_normalized() {
        let registry = Arc::new(ScopeRegistry::new());
        let seen = Arc::new(Mutex::new(None));
        let hook_seen = Arc::clone(&seen);
        registry
            .global_store()
            .add(
                after_fn("usage", move |_, output, _| {
                    *hook_seen.lock().unwrap() = output.usage_u64("total_tokens");
                    Ok(())
                }),
                None,
            )
            .await;

        let direct = assert_ok!(Huge.complete(CompletionRequest::user("Hi")).await);
        let hooked = HookedBackend::new(Huge, orchestrator(&registry));
        let response = assert_ok!(hooked.complete(CompletionRequest::user("Hi")).await);

        assert_eq!(response, direct);
        assert_eq!(*seen.lock().unwrap(), Some(u64::from(u32::MAX) + 1));
    }
}
