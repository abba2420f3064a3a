//! Data that flows through the hook pipeline.
//!
//! `CallInput` and `CallContext` are owned by a single call. `CallOutput`
//! and `CallResult` only borrow, so hooks can inspect the underlying
//! response and the finished call without copying either.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error type seen by error and finally hooks.
pub type DynError = dyn std::error::Error + Send + Sync + 'static;

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender ("system", "user", "assistant", ...)
    pub role: String,
    /// Message body
    pub content: String,
}

impl Message {
    /// Create a message with an arbitrary role.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Provider-agnostic input of a call.
///
/// Before hooks receive it mutably; whatever they leave behind is what the
/// underlying operation is invoked with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallInput {
    /// Model identifier
    pub model: String,
    /// Conversation messages, in order
    pub messages: Vec<Message>,
    /// Provider parameters
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Caller-supplied metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CallInput {
    /// Create an input for a model with no messages.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Append a message.
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Set a provider parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Normalized view of a successful response.
pub struct CallOutput<'r> {
    /// Generated text, if the response carried any
    pub text: Option<String>,
    /// The underlying response, for inspection only
    pub raw: &'r (dyn Any + Send + Sync),
    /// Numeric usage counters (token counts and the like)
    pub usage: Option<Map<String, Value>>,
    /// Why generation stopped
    pub finish_reason: Option<String>,
}

impl<'r> CallOutput<'r> {
    /// Wrap a raw response with no normalized fields.
    pub fn from_raw(raw: &'r (dyn Any + Send + Sync)) -> Self {
        Self {
            text: None,
            raw,
            usage: None,
            finish_reason: None,
        }
    }

    /// Set the text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set the usage counters.
    pub fn with_usage(mut self, usage: Map<String, Value>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Set the finish reason.
    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    /// Downcast the raw response to its concrete type.
    pub fn raw_as<T: Any>(&self) -> Option<&T> {
        self.raw.downcast_ref::<T>()
    }

    /// Read a usage counter as an integer.
    pub fn usage_u64(&self, key: &str) -> Option<u64> {
        self.usage.as_ref()?.get(key)?.as_u64()
    }
}

impl fmt::Debug for CallOutput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOutput")
            .field("text", &self.text)
            .field("usage", &self.usage)
            .field("finish_reason", &self.finish_reason)
            .finish_non_exhaustive()
    }
}

/// Identity and scratch space of one call.
///
/// Hooks may change `tags` and `metadata`; the identity fields are fixed
/// when the context is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallContext {
    call_id: String,
    parent_id: Option<String>,
    provider: String,
    model: String,
    route: String,
    started_at: DateTime<Utc>,
    /// Tags used for rule matching
    pub tags: BTreeSet<String>,
    /// Free-form metadata shared by all hooks of the call
    pub metadata: Map<String, Value>,
}

impl CallContext {
    /// Create a context with a fresh call id.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            provider: provider.into(),
            model: model.into(),
            route: "chat".to_string(),
            started_at: Utc::now(),
            tags: BTreeSet::new(),
            metadata: Map::new(),
        }
    }

    /// Link this call to a parent call.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Set the route (defaults to "chat").
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    /// Add tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Merge metadata entries.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the call carries a tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Terminal summary of one call, handed to finally hooks.
///
/// Holds only shared references, so nothing can change it once built.
#[derive(Debug, Clone, Copy)]
pub struct CallResult<'a> {
    pub input: &'a CallInput,
    /// Present only when the call succeeded
    pub output: Option<&'a CallOutput<'a>>,
    pub context: &'a CallContext,
    /// Present only when the call failed
    pub error: Option<&'a DynError>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_ms: f64,
}

impl CallResult<'_> {
    /// Whether the underlying operation succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Display text of the captured error.
    pub fn error_message(&self) -> Option<String> {
        self.error.map(|e| e.to_string())
    }
}
