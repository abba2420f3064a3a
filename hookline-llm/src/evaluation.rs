//! LLM-graded evaluation of successful completions.
//!
//! `EvaluationHook` is an after hook: it asks a separate evaluator backend
//! to score the response against named criteria and stores the scores in
//! the call's metadata, where later hooks (and `run_traced` callers) can
//! read them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hookline::{AfterHook, CallContext, CallInput, CallOutput, HookError};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::backend::{CompletionRequest, LlmBackend, Message};

/// Metadata key the scores are stored under unless overridden.
pub const DEFAULT_EVALUATION_KEY: &str = "evaluation";

/// Upper bound on the evaluator's reply length.
const MAX_EVALUATION_TOKENS: u32 = 256;

const EVALUATOR_PROMPT: &str = "You grade assistant responses. For each \
criterion, give a score between 0 and 1. Reply with only a JSON object \
mapping criterion names to scores.";

/// After hook that grades `output.text` with an evaluator backend.
///
/// Stored as `{"evaluator": <id>, "scores": {<criterion>: <0..1>}}`.
/// Scores outside 0..1 are clamped and criteria the evaluator did not
/// score are left out; a reply that scores none of them is a hook failure.
pub struct EvaluationHook<B> {
    evaluator: B,
    criteria: BTreeMap<String, String>,
    metadata_key: String,
}

impl<B: LlmBackend> EvaluationHook<B> {
    /// `criteria` maps a criterion name to the question the evaluator answers.
    pub fn new<I, K, V>(evaluator: B, criteria: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            evaluator,
            criteria: criteria
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            metadata_key: DEFAULT_EVALUATION_KEY.to_string(),
        }
    }

    /// Store scores under a different metadata key.
    pub fn with_metadata_key(mut self, key: impl Into<String>) -> Self {
        self.metadata_key = key.into();
        self
    }

    pub fn criteria(&self) -> &BTreeMap<String, String> {
        &self.criteria
    }

    pub fn evaluator(&self) -> &B {
        &self.evaluator
    }

    fn grading_request(&self, input: &CallInput, response: &str) -> CompletionRequest {
        let question = input
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let criteria: String = self
            .criteria
            .iter()
            .map(|(name, ask)| format!("- {name}: {ask}\n"))
            .collect();

        let capabilities = self.evaluator.capabilities();
        let mut request = CompletionRequest::default()
            .with_system(EVALUATOR_PROMPT)
            .with_message(Message::user(format!(
                "Question:\n{question}\n\nResponse:\n{response}\n\nCriteria:\n{criteria}"
            )))
            .with_temperature(0.0)
            .with_max_tokens(MAX_EVALUATION_TOKENS.min(capabilities.max_output_tokens));
        if capabilities.supports_json_mode {
            request = request.with_json_output();
        }
        request
    }
}

/// Pull the criterion scores out of an evaluator reply.
///
/// Tolerates prose or code fences around the JSON object.
fn parse_scores(
    reply: &str,
    criteria: &BTreeMap<String, String>,
) -> Result<Map<String, Value>, HookError> {
    let object = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => return Err(HookError::failed("Evaluator reply contains no JSON object")),
    };
    let graded: Map<String, Value> = serde_json::from_str(object)?;

    let scores: Map<String, Value> = criteria
        .keys()
        .filter_map(|name| {
            let score = graded.get(name)?.as_f64()?;
            Some((name.clone(), json!(score.clamp(0.0, 1.0))))
        })
        .collect();

    if scores.is_empty() {
        return Err(HookError::failed("Evaluator reply scored none of the criteria"));
    }
    Ok(scores)
}

#[async_trait]
impl<B: LlmBackend> AfterHook for EvaluationHook<B> {
    fn name(&self) -> &str {
        "evaluation"
    }

    async fn after(
        &self,
        input: &CallInput,
        output: &CallOutput<'_>,
        ctx: &mut CallContext,
    ) -> Result<(), HookError> {
        let Some(text) = output.text.as_deref() else {
            debug!(call_id = %ctx.call_id(), "No text to evaluate");
            return Ok(());
        };

        let request = self.grading_request(input, text);
        let reply = self
            .evaluator
            .complete(request)
            .await
            .map_err(HookError::other)?;
        let scores = parse_scores(&reply.content, &self.criteria)?;

        debug!(
            call_id = %ctx.call_id(),
            evaluator = %self.evaluator.id(),
            scored = scores.len(),
            "Response evaluated"
        );
        ctx.metadata.insert(
            self.metadata_key.clone(),
            json!({ "evaluator": self.evaluator.id(), "scores": scores }),
        );
        Ok(())
    }
}
