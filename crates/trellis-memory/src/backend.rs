use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{recency_cmp, ContextItem};

/// A single predicate for `MemoryBackend::query`. Filters are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemFilter {
    /// Item shares at least one of these tags. An empty list matches everything.
    TagsAny(Vec<String>),
    /// Item timestamp is at or after this instant.
    Since(DateTime<Utc>),
    /// Item timestamp is at or before this instant.
    Until(DateTime<Utc>),
    /// Item id starts with this prefix.
    IdPrefix(String),
}

impl ItemFilter {
    pub fn matches(&self, item: &ContextItem) -> bool {
        match self {
            Self::TagsAny(tags) => tags.is_empty() || item.has_any_tag(tags),
            Self::Since(ts) => item.timestamp >= *ts,
            Self::Until(ts) => item.timestamp <= *ts,
            Self::IdPrefix(prefix) => item.id.starts_with(prefix.as_str()),
        }
    }
}

/// Scope-agnostic timestamped key-value store.
///
/// Implementations must be safe to share between concurrently running tasks.
pub trait MemoryBackend: Send + Sync + 'static {
    /// Store an item, replacing any item with the same id (last write wins).
    fn put(&self, item: ContextItem) -> Result<()>;

    /// Fetch an item by id, or `TrellisError::NotFound`.
    fn get(&self, id: &str) -> Result<ContextItem>;

    /// Items matching every filter, newest first (ties by id ascending).
    fn query(&self, filters: &[ItemFilter], limit: Option<usize>) -> Result<Vec<ContextItem>>;

    /// Every stored item, newest first.
    fn list_all(&self) -> Result<Vec<ContextItem>> {
        self.query(&[], None)
    }

    /// Delete one item. Returns whether it existed.
    fn remove(&self, id: &str) -> Result<bool>;

    /// Remove everything.
    fn clear(&self) -> Result<()>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Process-lifetime backend guarded by a read/write lock.
#[derive(Default)]
pub struct InMemoryBackend {
    items: RwLock<HashMap<String, ContextItem>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> TrellisError {
    TrellisError::Storage(e.to_string())
}

impl MemoryBackend for InMemoryBackend {
    fn put(&self, item: ContextItem) -> Result<()> {
        let mut items = self.items.write().map_err(poisoned)?;
        debug!(id = %item.id, scope = %item.scope, "Memory item stored");
        items.insert(item.id.clone(), item);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<ContextItem> {
        let items = self.items.read().map_err(poisoned)?;
        items
            .get(id)
            .cloned()
            .ok_or_else(|| TrellisError::NotFound(id.to_string()))
    }

    fn query(&self, filters: &[ItemFilter], limit: Option<usize>) -> Result<Vec<ContextItem>> {
        let items = self.items.read().map_err(poisoned)?;
        let mut matched: Vec<ContextItem> = items
            .values()
            .filter(|item| filters.iter().all(|f| f.matches(item)))
            .cloned()
            .collect();
        drop(items);

        matched.sort_by(recency_cmp);
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let mut items = self.items.write().map_err(poisoned)?;
        Ok(items.remove(id).is_some())
    }

    fn clear(&self) -> Result<()> {
        let mut items = self.items.write().map_err(poisoned)?;
        items.clear();
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.items.read().map_err(poisoned)?.len())
    }
}
