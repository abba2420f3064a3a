//! Rules gate whether a registered hook runs for a given call.
//!
//! A rule is an immutable tree of leaf predicates joined by AND/OR/NOT. It
//! is evaluated fresh for every hook invocation.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::config::ConfigError;
use crate::hook::{panic_message, HookError};
use crate::types::{CallContext, CallInput};

type Predicate = dyn Fn(&CallInput, &CallContext) -> Result<bool, HookError> + Send + Sync;

/// Predicate over a call's input and context.
#[derive(Clone)]
pub struct Rule {
    node: Arc<RuleNode>,
}

enum RuleNode {
    Always,
    Model(String),
    Models(Vec<String>),
    Tag(String),
    AnyTag(Vec<String>),
    AllTags(Vec<String>),
    Metadata { key: String, value: Value },
    Custom { name: String, predicate: Box<Predicate> },
    And(Rule, Rule),
    Or(Rule, Rule),
    Not(Rule),
}

impl Rule {
    fn from_node(node: RuleNode) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    /// Matches every call.
    pub fn always() -> Self {
        Self::from_node(RuleNode::Always)
    }

    /// Exact match on `CallInput::model`.
    pub fn model(name: impl Into<String>) -> Self {
        Self::from_node(RuleNode::Model(name.into()))
    }

    /// Model is one of `names`.
    pub fn models<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_node(RuleNode::Models(names.into_iter().map(Into::into).collect()))
    }

    /// Call context carries `name` as a tag.
    pub fn tag(name: impl Into<String>) -> Self {
        Self::from_node(RuleNode::Tag(name.into()))
    }

    /// Call context carries at least one of `names`.
    pub fn any_tag<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_node(RuleNode::AnyTag(names.into_iter().map(Into::into).collect()))
    }

    /// Call context carries every one of `names`.
    pub fn all_tags<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_node(RuleNode::AllTags(names.into_iter().map(Into::into).collect()))
    }

    /// Metadata `key` equals `value`.
    ///
    /// Looks in the input's metadata first, then in the context's.
    pub fn metadata(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::from_node(RuleNode::Metadata {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Rule backed by an infallible predicate.
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&CallInput, &CallContext) -> bool + Send + Sync + 'static,
    {
        Self::try_custom(name, move |input, ctx| Ok(predicate(input, ctx)))
    }

    /// Rule backed by a fallible predicate. An error counts as no match.
    pub fn try_custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&CallInput, &CallContext) -> Result<bool, HookError> + Send + Sync + 'static,
    {
        Self::from_node(RuleNode::Custom {
            name: name.into(),
            predicate: Box::new(predicate),
        })
    }

    /// Both rules match. `other` is not evaluated when `self` fails.
    pub fn and(self, other: Rule) -> Self {
        Self::from_node(RuleNode::And(self, other))
    }

    /// Either rule matches. `other` is not evaluated when `self` matches.
    pub fn or(self, other: Rule) -> Self {
        Self::from_node(RuleNode::Or(self, other))
    }

    /// Inverts the rule.
    pub fn negate(self) -> Self {
        Self::from_node(RuleNode::Not(self))
    }

    /// AND of every rule, left to right. Empty input is a configuration error.
    pub fn all(rules: impl IntoIterator<Item = Rule>) -> Result<Self, ConfigError> {
        rules
            .into_iter()
            .reduce(Rule::and)
            .ok_or(ConfigError::EmptyRule("all"))
    }

    /// OR of every rule, left to right. Empty input is a configuration error.
    pub fn any(rules: impl IntoIterator<Item = Rule>) -> Result<Self, ConfigError> {
        rules
            .into_iter()
            .reduce(Rule::or)
            .ok_or(ConfigError::EmptyRule("any"))
    }

    /// Whether the rule matches. Any fault inside the rule is a non-match.
    pub fn matches(&self, input: &CallInput, ctx: &CallContext) -> bool {
        self.try_matches(input, ctx).unwrap_or(false)
    }

    /// Evaluate the rule, surfacing faults instead of hiding them.
    ///
    /// A panicking predicate is caught and returned as `HookError::Panicked`.
    pub fn try_matches(&self, input: &CallInput, ctx: &CallContext) -> Result<bool, HookError> {
        match catch_unwind(AssertUnwindSafe(|| self.evaluate(input, ctx))) {
            Ok(result) => result,
            Err(payload) => Err(HookError::Panicked(format!(
                "rule {self} panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    fn evaluate(&self, input: &CallInput, ctx: &CallContext) -> Result<bool, HookError> {
        let matched = match self.node.as_ref() {
            RuleNode::Always => true,
            RuleNode::Model(name) => input.model == *name,
            RuleNode::Models(names) => names.iter().any(|n| *n == input.model),
            RuleNode::Tag(tag) => ctx.has_tag(tag),
            RuleNode::AnyTag(tags) => tags.iter().any(|t| ctx.has_tag(t)),
            RuleNode::AllTags(tags) => tags.iter().all(|t| ctx.has_tag(t)),
            RuleNode::Metadata { key, value } => input
                .metadata
                .get(key)
                .or_else(|| ctx.metadata.get(key))
                .is_some_and(|v| v == value),
            RuleNode::Custom { name, predicate } => {
                predicate(input, ctx).map_err(|e| HookError::Rule {
                    rule: name.clone(),
                    reason: e.to_string(),
                })?
            }
            RuleNode::And(a, b) => a.evaluate(input, ctx)? && b.evaluate(input, ctx)?,
            RuleNode::Or(a, b) => a.evaluate(input, ctx)? || b.evaluate(input, ctx)?,
            RuleNode::Not(r) => !r.evaluate(input, ctx)?,
        };
        Ok(matched)
    }
}

impl BitAnd for Rule {
    type Output = Rule;

    fn bitand(self, rhs: Rule) -> Rule {
        self.and(rhs)
    }
}

impl BitOr for Rule {
    type Output = Rule;

    fn bitor(self, rhs: Rule) -> Rule {
        self.or(rhs)
    }
}

impl Not for Rule {
    type Output = Rule;

    fn not(self) -> Rule {
        self.negate()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node.as_ref() {
            RuleNode::Always => f.write_str("always"),
            RuleNode::Model(name) => write!(f, "model == {name:?}"),
            RuleNode::Models(names) => write!(f, "model in {names:?}"),
            RuleNode::Tag(tag) => write!(f, "tag {tag:?}"),
            RuleNode::AnyTag(tags) => write!(f, "any tag of {tags:?}"),
            RuleNode::AllTags(tags) => write!(f, "all tags of {tags:?}"),
            RuleNode::Metadata { key, value } => write!(f, "metadata[{key:?}] == {value}"),
            RuleNode::Custom { name, .. } => write!(f, "custom({name})"),
            RuleNode::And(a, b) => write!(f, "({a} && {b})"),
            RuleNode::Or(a, b) => write!(f, "({a} || {b})"),
            RuleNode::Not(r) => write!(f, "!{r}"),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rule({self})")
    }
}
