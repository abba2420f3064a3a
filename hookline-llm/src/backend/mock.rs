//! Mock LLM backend for testing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::traits::*;

/// Rough token estimate used by the mock: four characters per token.
const CHARS_PER_TOKEN: usize = 4;

/// Scripted backend for tests.
///
/// Answers with a fixed response, optionally after a delay or with a
/// failure, and remembers the last request so tests can see what hooks
/// did to it.
pub struct MockBackend {
    model_id: String,
    available: AtomicBool,
    capabilities: ModelCapabilities,
    response_content: String,
    failure: Option<String>,
    delay: Option<Duration>,
    call_count: AtomicU32,
    last_request: RwLock<Option<CompletionRequest>>,
}

impl MockBackend {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            available: AtomicBool::new(true),
            capabilities: ModelCapabilities::default(),
            response_content: "Mock response".to_string(),
            failure: None,
            delay: None,
            call_count: AtomicU32::new(0),
            last_request: RwLock::new(None),
        }
    }

    pub fn with_response(mut self, content: impl Into<String>) -> Self {
        self.response_content = content.into();
        self
    }

    /// Fail every completion with `RequestFailed`.
    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Wait before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Number of `complete` calls so far.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The most recent request received.
    pub async fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.read().await.clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new("mock-model")
    }
}

fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.len() / CHARS_PER_TOKEN).unwrap_or(u32::MAX)
}

#[async_trait]
impl LlmBackend for MockBackend {
    fn id(&self) -> &str {
        &self.model_id
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        let prompt_tokens = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .fold(0u32, u32::saturating_add);
        let max_tokens = request.max_tokens;
        *self.last_request.write().await = Some(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(LlmError::Unavailable("Mock backend disabled".to_string()));
        }
        if let Some(reason) = &self.failure {
            return Err(LlmError::RequestFailed(reason.clone()));
        }

        let mut content = self.response_content.clone();
        let mut finish_reason = FinishReason::Stop;
        if let Some(max) = max_tokens {
            let limit = (max as usize).saturating_mul(CHARS_PER_TOKEN);
            if content.len() > limit {
                let cut = (0..=limit)
                    .rev()
                    .find(|&i| content.is_char_boundary(i))
                    .unwrap_or(0);
                content.truncate(cut);
                finish_reason = FinishReason::Length;
            }
        }

        Ok(CompletionResponse {
            usage: Usage {
                prompt_tokens,
                completion_tokens: estimate_tokens(&content),
            },
            content,
            finish_reason,
        })
    }

    fn capabilities(&self) -> &ModelCapabilities {
        &self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_mock_backend() {
        let backend = MockBackend::new("test-model").with_response("Hello, world!");

        assert!(backend.is_available().await);
        assert_eq!(backend.call_count(), 0);

        let response = assert_ok!(backend.complete(CompletionRequest::user("Hi")).await);

        assert_eq!(response.content, "Hello, world!");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(backend.call_count(), 1);
        assert_eq!(
            backend.last_request().await,
            Some(CompletionRequest::user("Hi"))
        );
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let backend = MockBackend::new("test-model").with_available(false);

        assert!(!backend.is_available().await);

        let err = assert_err!(backend.complete(CompletionRequest::user("Hi")).await);
        assert!(matches!(err, LlmError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let backend = MockBackend::new("test-model").with_failure("boom");

        let err = assert_err!(backend.complete(CompletionRequest::user("Hi")).await);
        assert!(matches!(err, LlmError::RequestFailed(r) if r == "boom"));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_truncates_at_max_tokens() {
        let backend = MockBackend::new("test-model").with_response("abcdefghijkl");

        let response = assert_ok!(
            backend
                .complete(CompletionRequest::user("Hi").with_max_tokens(2))
                .await
        );

        assert_eq!(response.content, "abcdefgh");
        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(response.usage.completion_tokens, 2);
    }
}
