//! Scopes: named hook namespaces a call can opt into.
//!
//! Every call consults the global store, then the stores it asked for.

pub mod registry;
pub mod store;

pub use registry::{ScopeRegistry, GLOBAL_SCOPE};
pub use store::{AfterEntry, BeforeEntry, ErrorEntry, FinallyEntry, ScopeStore};
