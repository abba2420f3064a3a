//! Engine configuration and declarative hook wiring.
//!
//! `EngineConfig` tunes the executor and orchestrator. `HooksConfig`
//! describes which hooks go into which scope; hook implementations are
//! looked up by key in a `HookCatalog`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::hook::{Hook, HookKind};
use crate::rule::Rule;
use crate::scope::ScopeRegistry;

/// Configuration and misuse errors. Raised at setup time, never per call.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown hook kind {0:?} (expected before, after, error or finally)")]
    UnknownHookKind(String),

    #[error("Cannot build an empty `{0}` rule")]
    EmptyRule(&'static str),

    #[error("Hook {hook:?}: `when` sets no conditions")]
    EmptyWhen { hook: String },

    #[error("Hook {hook:?}: `all_calls` cannot be combined with other conditions")]
    ConflictingWhen { hook: String },

    #[error("Hook {hook:?} refers to unknown catalog entry {key:?}")]
    UnknownHook { hook: String, key: String },

    #[error("Hook {hook:?} is declared as {declared} but {key:?} is a {actual} hook")]
    KindMismatch {
        hook: String,
        key: String,
        declared: HookKind,
        actual: HookKind,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hook executor settings
    pub executor: ExecutorConfig,
    /// Call orchestrator settings
    pub orchestrator: OrchestratorConfig,
}

impl EngineConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Hook executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Log every hook failure at warn level
    pub log_failures: bool,
    /// Upper bound for a single hook invocation (ms); unbounded when unset
    pub hook_timeout_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            log_failures: true,
            hook_timeout_ms: None,
        }
    }
}

impl ExecutorConfig {
    pub fn hook_timeout(&self) -> Option<Duration> {
        self.hook_timeout_ms.map(Duration::from_millis)
    }
}

/// Call orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Timeout applied to the underlying call when the caller sets none (ms)
    pub default_timeout_ms: Option<u64>,
}

impl OrchestratorConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Conditions of a declared hook. Set conditions are ANDed together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WhenConfig {
    pub model: Option<String>,
    pub models: Option<Vec<String>>,
    pub tag: Option<String>,
    /// Matches when any of these tags is present
    pub tags: Option<Vec<String>>,
    /// Every entry must match
    pub metadata: Option<Map<String, Value>>,
    pub all_calls: bool,
}

impl WhenConfig {
    /// Build the rule described by this block.
    pub fn to_rule(&self, hook: &str) -> Result<Rule, ConfigError> {
        let mut parts = Vec::new();

        if let Some(model) = &self.model {
            parts.push(Rule::model(model.clone()));
        }
        if let Some(models) = self.models.as_ref().filter(|m| !m.is_empty()) {
            parts.push(Rule::models(models.iter().cloned()));
        }
        if let Some(tag) = &self.tag {
            parts.push(Rule::tag(tag.clone()));
        }
        if let Some(tags) = self.tags.as_ref().filter(|t| !t.is_empty()) {
            parts.push(Rule::any_tag(tags.iter().cloned()));
        }
        if let Some(metadata) = &self.metadata {
            for (key, value) in metadata {
                parts.push(Rule::metadata(key.clone(), value.clone()));
            }
        }

        match (self.all_calls, parts.is_empty()) {
            (true, true) => Ok(Rule::always()),
            (true, false) => Err(ConfigError::ConflictingWhen {
                hook: hook.to_string(),
            }),
            (false, _) => Rule::all(parts).map_err(|_| ConfigError::EmptyWhen {
                hook: hook.to_string(),
            }),
        }
    }
}

/// One declared hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSpec {
    /// Display name of this registration
    pub name: String,
    /// before, after, error or finally
    #[serde(rename = "type")]
    pub kind: String,
    /// Catalog key of the implementation; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenConfig>,
}

impl HookSpec {
    fn catalog_key(&self) -> &str {
        self.hook.as_deref().unwrap_or(&self.name)
    }

    /// Look up the hook and build its rule, checking the declared kind.
    fn resolve(&self, catalog: &HookCatalog) -> Result<(Hook, Option<Rule>), ConfigError> {
        let declared: HookKind = self.kind.parse()?;
        let key = self.catalog_key();

        let hook = catalog.get(key).ok_or_else(|| ConfigError::UnknownHook {
            hook: self.name.clone(),
            key: key.to_string(),
        })?;

        if hook.kind() != declared {
            return Err(ConfigError::KindMismatch {
                hook: self.name.clone(),
                key: key.to_string(),
                declared,
                actual: hook.kind(),
            });
        }

        let rule = self
            .when
            .as_ref()
            .map(|when| when.to_rule(&self.name))
            .transpose()?;

        Ok((hook.clone(), rule))
    }
}

/// Hooks of one named scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeSpec {
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
}

/// Declarative hook wiring for a whole registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub global_hooks: Vec<HookSpec>,
    pub scopes: BTreeMap<String, ScopeSpec>,
}

impl HooksConfig {
    /// Parse from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Register every declared hook.
    ///
    /// All specs are validated first; nothing is registered if any is
    /// invalid. Returns the number of registrations.
    pub async fn apply(
        &self,
        registry: &ScopeRegistry,
        catalog: &HookCatalog,
    ) -> Result<usize, ConfigError> {
        let mut planned: Vec<(Option<&str>, Hook, Option<Rule>)> = Vec::new();

        for entry in &self.global_hooks {
            let (hook, rule) = entry.resolve(catalog)?;
            planned.push((None, hook, rule));
        }
        for (scope, scope_spec) in &self.scopes {
            for entry in &scope_spec.hooks {
                let (hook, rule) = entry.resolve(catalog)?;
                planned.push((Some(scope.as_str()), hook, rule));
            }
        }

        let count = planned.len();
        for (scope, hook, rule) in planned {
            let store = match scope {
                Some(name) => registry.get_or_create(name),
                None => registry.global_store(),
            };
            store.add(hook, rule).await;
        }

        info!(registrations = count, "Applied hook configuration");
        Ok(count)
    }
}

/// Named hook implementations that configuration can refer to.
#[derive(Debug, Clone, Default)]
pub struct HookCatalog {
    hooks: HashMap<String, Hook>,
}

impl HookCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook under `key`, replacing any previous entry.
    pub fn with(mut self, key: impl Into<String>, hook: Hook) -> Self {
        self.insert(key, hook);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, hook: Hook) {
        self.hooks.insert(key.into(), hook);
    }

    pub fn get(&self, key: &str) -> Option<&Hook> {
        self.hooks.get(key)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
