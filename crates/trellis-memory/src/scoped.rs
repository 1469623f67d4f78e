use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{ContextItem, ProjectId, Scope, TaskId};

use crate::backend::{InMemoryBackend, ItemFilter, MemoryBackend};

type BackendFactory = Arc<dyn Fn() -> Arc<dyn MemoryBackend> + Send + Sync>;

fn poisoned<E: std::fmt::Display>(e: E) -> TrellisError {
    TrellisError::Storage(e.to_string())
}

/// One backend instance per scope key (task id, project id, or the
/// process-wide singleton `()`).
///
/// Visibility comes from the key: a caller only ever reaches the instance
/// for the key it presents.
pub struct ScopedStore<K> {
    scope: Scope,
    instances: RwLock<HashMap<K, Arc<dyn MemoryBackend>>>,
    last_accessed: RwLock<HashMap<K, DateTime<Utc>>>,
    factory: BackendFactory,
}

impl<K> ScopedStore<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(scope: Scope) -> Self {
        Self::with_factory(
            scope,
            Arc::new(|| Arc::new(InMemoryBackend::new()) as Arc<dyn MemoryBackend>),
        )
    }

    /// Use a custom backend for every instance of this scope.
    pub fn with_factory(scope: Scope, factory: BackendFactory) -> Self {
        Self {
            scope,
            instances: RwLock::new(HashMap::new()),
            last_accessed: RwLock::new(HashMap::new()),
            factory,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Get the instance for `key`, creating it on first use.
    pub fn instance(&self, key: &K) -> Result<Arc<dyn MemoryBackend>> {
        if let Some(existing) = self.existing(key)? {
            return Ok(existing);
        }
        let mut instances = self.instances.write().map_err(poisoned)?;
        let backend = instances
            .entry(key.clone())
            .or_insert_with(|| (self.factory)());
        Ok(Arc::clone(backend))
    }

    /// Get the instance for `key` without creating one.
    pub fn existing(&self, key: &K) -> Result<Option<Arc<dyn MemoryBackend>>> {
        let instances = self.instances.read().map_err(poisoned)?;
        Ok(instances.get(key).cloned())
    }

    /// Store an item under `key`. The item is re-stamped with this store's scope.
    pub fn put(&self, key: &K, mut item: ContextItem) -> Result<()> {
        item.scope = self.scope;
        self.instance(key)?.put(item)
    }

    pub fn get(&self, key: &K, id: &str) -> Result<ContextItem> {
        match self.existing(key)? {
            Some(backend) => backend.get(id),
            None => Err(TrellisError::NotFound(id.to_string())),
        }
    }

    /// Query the instance for `key`; an instance never written to yields nothing.
    pub fn query(
        &self,
        key: &K,
        filters: &[ItemFilter],
        limit: Option<usize>,
    ) -> Result<Vec<ContextItem>> {
        match self.existing(key)? {
            Some(backend) => backend.query(filters, limit),
            None => Ok(Vec::new()),
        }
    }

    /// Record a read of `key` at the current time.
    pub fn touch(&self, key: &K) -> Result<()> {
        let mut accessed = self.last_accessed.write().map_err(poisoned)?;
        accessed.insert(key.clone(), Utc::now());
        Ok(())
    }

    pub fn last_accessed(&self, key: &K) -> Result<Option<DateTime<Utc>>> {
        let accessed = self.last_accessed.read().map_err(poisoned)?;
        Ok(accessed.get(key).copied())
    }

    /// Clear and drop the instance for `key`. Returns how many items were removed.
    pub fn purge(&self, key: &K) -> Result<usize> {
        let removed = {
            let mut instances = self.instances.write().map_err(poisoned)?;
            instances.remove(key)
        };
        self.last_accessed.write().map_err(poisoned)?.remove(key);

        match removed {
            Some(backend) => {
                let count = backend.len()?;
                backend.clear()?;
                debug!(scope = %self.scope, key = ?key, count, "Scoped store purged");
                Ok(count)
            }
            None => Ok(0),
        }
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> Result<usize> {
        Ok(self.instances.read().map_err(poisoned)?.len())
    }
}

/// Identifies which task (and therefore which project) is reading or writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeKey {
    pub task: TaskId,
    pub project: ProjectId,
}

impl ScopeKey {
    pub fn new(task: TaskId, project: ProjectId) -> Self {
        Self { task, project }
    }
}

/// The three memory tiers, built once at engine start and shared by
/// the assembler and the executor.
pub struct MemoryHub {
    pub tasks: ScopedStore<TaskId>,
    pub projects: ScopedStore<ProjectId>,
    pub global: ScopedStore<()>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            tasks: ScopedStore::new(Scope::Task),
            projects: ScopedStore::new(Scope::Project),
            global: ScopedStore::new(Scope::Global),
        }
    }

    /// Write an item into the tier named by `scope`, as seen by `key`.
    pub fn write(&self, scope: Scope, key: &ScopeKey, item: ContextItem) -> Result<()> {
        match scope {
            Scope::Task => self.tasks.put(&key.task, item),
            Scope::Project => self.projects.put(&key.project, item),
            Scope::Global => self.global.put(&(), item),
        }
    }

    /// Query the tier named by `scope`, as seen by `key`.
    pub fn query(
        &self,
        scope: Scope,
        key: &ScopeKey,
        filters: &[ItemFilter],
        limit: Option<usize>,
    ) -> Result<Vec<ContextItem>> {
        match scope {
            Scope::Task => self.tasks.query(&key.task, filters, limit),
            Scope::Project => self.projects.query(&key.project, filters, limit),
            Scope::Global => self.global.query(&(), filters, limit),
        }
    }

    /// Drop all task-scoped items of a concluded task.
    pub fn purge_task(&self, task: &TaskId) -> Result<usize> {
        self.tasks.purge(task)
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}
