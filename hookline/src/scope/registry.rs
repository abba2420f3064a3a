//! Name-to-store resolution.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::store::ScopeStore;

/// Name given to the always-active store.
pub const GLOBAL_SCOPE: &str = "global";

/// Owns every named scope store plus the global one.
///
/// Stores are created on first reference and live as long as the registry.
/// Independent registries never share stores.
pub struct ScopeRegistry {
    global: Arc<ScopeStore>,
    scopes: DashMap<String, Arc<ScopeStore>>,
}

impl ScopeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            global: Arc::new(ScopeStore::new(GLOBAL_SCOPE)),
            scopes: DashMap::new(),
        }
    }

    /// The store for `name`, created if absent.
    ///
    /// Concurrent first access yields one store.
    pub fn get_or_create(&self, name: &str) -> Arc<ScopeStore> {
        if let Some(store) = self.scopes.get(name) {
            return Arc::clone(store.value());
        }

        let store = self.scopes.entry(name.to_string()).or_insert_with(|| {
            debug!(scope = %name, "Creating scope");
            Arc::new(ScopeStore::new(name))
        });
        Arc::clone(store.value())
    }

    /// The store whose hooks run for every call.
    pub fn global_store(&self) -> Arc<ScopeStore> {
        Arc::clone(&self.global)
    }

    /// Stores consulted for a call: global first, then `names` in order.
    ///
    /// Duplicate names are kept, so their hooks run once per occurrence.
    pub fn resolve_for_client<S: AsRef<str>>(&self, names: &[S]) -> Vec<Arc<ScopeStore>> {
        std::iter::once(self.global_store())
            .chain(names.iter().map(|n| self.get_or_create(n.as_ref())))
            .collect()
    }

    /// Whether a named store exists.
    pub fn contains(&self, name: &str) -> bool {
        self.scopes.contains_key(name)
    }

    /// Names of every created scope, sorted.
    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scopes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScopeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("scopes", &self.scope_names())
            .finish_non_exhaustive()
    }
}
