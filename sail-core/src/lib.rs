//! Core library for incremental monorepo build orchestration.

pub mod build_graph;
pub mod cache_key;
pub mod config;
pub mod context;
pub mod definitions;
pub mod error;
pub mod events;
pub mod executor;
pub mod globs;
pub mod hashing;
pub mod package;
pub mod queue;
pub mod refs;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod task;
pub mod worker;
pub mod workspace;

pub use build_graph::{BuildGraph, LeafSpec, Priority, TaskIndex, TaskKind, TaskNode};
pub use cache_key::CacheKey;
pub use config::{BuildConfig, DeclarativeTask, ScriptSpec, TaskConfig, TaskDefinition};
pub use context::{BuildContext, CancelToken, ContextOptions};
pub use definitions::{ResolvedTask, ResolvedTaskSet, TaskAction, TaskDefinitionResolver};
pub use error::{Error, ErrorCategory, Result};
pub use events::{BuildEvent, BuildStatus, EventSink};
pub use executor::{BuildCounters, BuildExecutor, BuildResult, ExecutorOptions, TaskSummary};
pub use hashing::{FileHashCache, PersistableHashCache};
pub use package::{Package, PackageId, PackageManifest};
pub use queue::{PriorityTaskQueue, QueueEntry};
pub use refs::{TaskId, TaskRef};
pub use registry::{CachingMode, LeafPlan, TaskHandler, TaskRegistry};
pub use resolver::{DependencyResolver, PackageFilter, PackageGraph};
pub use store::{CacheManifest, SharedCacheStore, StoreOptions, StoreStatsSnapshot};
pub use task::{Freshness, TaskOps, TaskOutcome, TaskState};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerRequest, WorkerResponse};
pub use workspace::{
    LockfilePresenceCheck, PackageManagerAdapter, Workspace, WorkspaceAdapter, WorkspaceScanner,
};
