//! Append-only hook storage for one scope.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::hook::{
    AfterHook, BeforeHook, ErrorHook, FinallyHook, Hook, HookKind, Registration,
};
use crate::rule::Rule;

pub type BeforeEntry = Registration<Arc<dyn BeforeHook>>;
pub type AfterEntry = Registration<Arc<dyn AfterHook>>;
pub type ErrorEntry = Registration<Arc<dyn ErrorHook>>;
pub type FinallyEntry = Registration<Arc<dyn FinallyHook>>;

/// Hook lists of a single scope.
///
/// Registration order is execution order. Entries are never removed; every
/// read hands out a copy so iteration never races with registration.
pub struct ScopeStore {
    name: String,
    before: RwLock<Vec<BeforeEntry>>,
    after: RwLock<Vec<AfterEntry>>,
    error: RwLock<Vec<ErrorEntry>>,
    finally: RwLock<Vec<FinallyEntry>>,
}

impl ScopeStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: RwLock::new(Vec::new()),
            after: RwLock::new(Vec::new()),
            error: RwLock::new(Vec::new()),
            finally: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a hook to the list for its kind.
    ///
    /// Finally hooks always run, so a rule passed with one is dropped.
    pub async fn add(&self, hook: Hook, rule: Option<Rule>) {
        info!(
            scope = %self.name,
            kind = %hook.kind(),
            hook = hook.name(),
            conditional = rule.is_some(),
            "Registering hook"
        );

        match hook {
            Hook::Before(h) => self.before.write().await.push(Registration::new(h, rule)),
            Hook::After(h) => self.after.write().await.push(Registration::new(h, rule)),
            Hook::Error(h) => self.error.write().await.push(Registration::new(h, rule)),
            Hook::Finally(h) => {
                if let Some(rule) = rule {
                    warn!(
                        scope = %self.name,
                        hook = h.name(),
                        rule = %rule,
                        "Finally hooks always run; ignoring rule"
                    );
                }
                self.finally.write().await.push(Registration::new(h, None));
            }
        }
    }

    /// Register a before hook.
    pub async fn before(&self, hook: impl BeforeHook + 'static) {
        self.add(Hook::before(hook), None).await;
    }

    /// Register a before hook gated by a rule.
    pub async fn before_when(&self, hook: impl BeforeHook + 'static, rule: Rule) {
        self.add(Hook::before(hook), Some(rule)).await;
    }

    /// Register an after hook.
    pub async fn after(&self, hook: impl AfterHook + 'static) {
        self.add(Hook::after(hook), None).await;
    }

    /// Register an after hook gated by a rule.
    pub async fn after_when(&self, hook: impl AfterHook + 'static, rule: Rule) {
        self.add(Hook::after(hook), Some(rule)).await;
    }

    /// Register an error hook.
    pub async fn error(&self, hook: impl ErrorHook + 'static) {
        self.add(Hook::error(hook), None).await;
    }

    /// Register an error hook gated by a rule.
    pub async fn error_when(&self, hook: impl ErrorHook + 'static, rule: Rule) {
        self.add(Hook::error(hook), Some(rule)).await;
    }

    /// Register a finally hook.
    pub async fn finally(&self, hook: impl FinallyHook + 'static) {
        self.add(Hook::finally(hook), None).await;
    }

    /// Snapshot of one list as untyped hooks.
    pub async fn list(&self, kind: HookKind) -> Vec<Registration<Hook>> {
        match kind {
            HookKind::Before => self
                .before_hooks()
                .await
                .into_iter()
                .map(|r| Registration::new(Hook::Before(r.hook), r.rule))
                .collect(),
            HookKind::After => self
                .after_hooks()
                .await
                .into_iter()
                .map(|r| Registration::new(Hook::After(r.hook), r.rule))
                .collect(),
            HookKind::Error => self
                .error_hooks()
                .await
                .into_iter()
                .map(|r| Registration::new(Hook::Error(r.hook), r.rule))
                .collect(),
            HookKind::Finally => self
                .finally_hooks()
                .await
                .into_iter()
                .map(|r| Registration::new(Hook::Finally(r.hook), r.rule))
                .collect(),
        }
    }

    /// Number of hooks registered for a kind.
    pub async fn len(&self, kind: HookKind) -> usize {
        match kind {
            HookKind::Before => self.before.read().await.len(),
            HookKind::After => self.after.read().await.len(),
            HookKind::Error => self.error.read().await.len(),
            HookKind::Finally => self.finally.read().await.len(),
        }
    }

    /// Whether no hooks of any kind are registered.
    pub async fn is_empty(&self) -> bool {
        for kind in HookKind::ALL {
            if self.len(kind).await > 0 {
                return false;
            }
        }
        true
    }

    pub async fn before_hooks(&self) -> Vec<BeforeEntry> {
        self.before.read().await.clone()
    }

    pub async fn after_hooks(&self) -> Vec<AfterEntry> {
        self.after.read().await.clone()
    }

    pub async fn error_hooks(&self) -> Vec<ErrorEntry> {
        self.error.read().await.clone()
    }

    pub async fn finally_hooks(&self) -> Vec<FinallyEntry> {
        self.finally.read().await.clone()
    }
}

impl std::fmt::Debug for ScopeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeStore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{after_fn, before_fn, finally_fn};

    #[tokio::test]
    async fn test_add_preserves_order() {
        let store = ScopeStore::new("s");

        store.add(before_fn("first", |_, _| Ok(())), None).await;
        store
            .add(before_fn("second", |_, _| Ok(())), Some(Rule::tag("prod")))
            .await;
        store.add(after_fn("third", |_, _, _| Ok(())), None).await;

        let names: Vec<String> = store
            .list(HookKind::Before)
            .await
            .iter()
            .map(|r| r.hook.name().to_string())
            .collect();
        assert_eq!(names, ["first", "second"]);

        let before = store.before_hooks().await;
        assert!(before[0].rule.is_none());
        assert!(before[1].rule.is_some());
        assert_eq!(store.len(HookKind::After).await, 1);
        assert_eq!(store.len(HookKind::Error).await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let store = ScopeStore::new("s");
        store.add(before_fn("a", |_, _| Ok(())), None).await;

        let snapshot = store.before_hooks().await;
        store.add(before_fn("b", |_, _| Ok(())), None).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len(HookKind::Before).await, 2);
    }

    #[tokio::test]
    async fn test_finally_rule_is_dropped() {
        let store = ScopeStore::new("s");
        assert!(store.is_empty().await);

        store
            .add(finally_fn("audit", |_| Ok(())), Some(Rule::model("gpt-4")))
            .await;

        let finally = store.finally_hooks().await;
        assert_eq!(finally.len(), 1);
        assert!(finally[0].rule.is_none());
        assert!(!store.is_empty().await);
    }
}
