//! Per-build context owning the caches, registry, and worker pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::events::{EventSink, NullSink};
use crate::hashing::FileHashCache;
use crate::registry::TaskRegistry;
use crate::store::{SharedCacheStore, StoreOptions, STORE_LAYOUT_VERSION};
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// Cooperative cancellation signal shared between the CLI, the executor, and
/// in-flight task processes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Context construction options. Environment toggles are read here, once;
/// nothing deeper in the engine consults the environment.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub store: StoreOptions,
    /// Location of the persisted file-hash memo; `None` disables persistence.
    pub hash_memo_path: Option<PathBuf>,
    /// When set, leaf commands are dispatched through a worker pool.
    pub worker_pool: Option<WorkerPoolConfig>,
}

impl ContextOptions {
    /// Defaults plus the `SAIL_*` environment contract, rooted at the
    /// workspace.
    pub fn from_env(workspace_root: &Path) -> Self {
        let store = StoreOptions::from_env(workspace_root);
        let hash_memo_path = Some(
            store
                .root
                .join(STORE_LAYOUT_VERSION)
                .join("file-hashes.bin"),
        );
        Self {
            store,
            hash_memo_path,
            worker_pool: None,
        }
    }
}

/// Owns the subsystems a build needs. Tests construct a fresh context per
/// scenario; there are no process-wide singletons.
pub struct BuildContext {
    pub file_hashes: FileHashCache,
    pub store: SharedCacheStore,
    pub registry: TaskRegistry,
    pub worker_pool: Option<WorkerPool>,
    pub events: Box<dyn EventSink>,
}

impl BuildContext {
    pub fn new(options: ContextOptions) -> Result<Self> {
        let file_hashes = match &options.hash_memo_path {
            Some(path) => FileHashCache::with_persistence(path.clone()),
            None => FileHashCache::new(),
        };
        let store = SharedCacheStore::new(options.store.clone())?;
        let worker_pool = options.worker_pool.clone().map(WorkerPool::new);
        Ok(Self {
            file_hashes,
            store,
            registry: TaskRegistry::new(),
            worker_pool,
            events: Box::new(NullSink),
        })
    }

    pub fn with_events(mut self, events: Box<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_context_builds_store_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut options = ContextOptions::from_env(tmp.path());
        options.store.root = tmp.path().join("cache");
        options.hash_memo_path = None;
        let _context = BuildContext::new(options).unwrap();
        assert!(tmp.path().join("cache/v1/entries").is_dir());
    }
}
