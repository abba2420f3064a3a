//! Process-wide default registry.
//!
//! Library code should take an explicit `Arc<ScopeRegistry>`; these helpers
//! exist for applications that want one shared registry without plumbing it.

use std::sync::{Arc, OnceLock};

use crate::scope::{ScopeRegistry, ScopeStore};

static DEFAULT: OnceLock<Arc<ScopeRegistry>> = OnceLock::new();

/// The shared default registry, created on first use.
pub fn default_registry() -> Arc<ScopeRegistry> {
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(ScopeRegistry::new())))
}

/// Named store in the default registry.
pub fn scope(name: &str) -> Arc<ScopeStore> {
    default_registry().get_or_create(name)
}

/// Global store of the default registry.
pub fn global_scope() -> Arc<ScopeStore> {
    default_registry().global_store()
}
