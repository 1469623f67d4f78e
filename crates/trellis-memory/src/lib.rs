pub mod backend;
pub mod scoped;

pub use backend::{InMemoryBackend, ItemFilter, MemoryBackend};
pub use scoped::{MemoryHub, ScopeKey, ScopedStore};
