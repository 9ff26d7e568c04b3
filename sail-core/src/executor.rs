//! Top-level build driver: up-to-date pass, execution pass, reduction.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::build_graph::{BuildGraph, TaskIndex};
use crate::context::{BuildContext, CancelToken};
use crate::error::{Error, Result};
use crate::events::{BuildEvent, BuildStatus};
use crate::hashing::PersistableHashCache;
use crate::queue::{PriorityTaskQueue, QueueEntry};
use crate::refs::TaskId;
use crate::store::StoreStatsSnapshot;
use crate::task::{Freshness, TaskOps, TaskOutcome, TaskState};
use crate::workspace::Workspace;

/// Executor tuning. Defaults follow the machine: one queue worker per CPU,
/// eight-wide hashing over twenty-task batches during the up-to-date pass.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub concurrency: usize,
    /// Ignore donefiles and store hits; every scheduled task executes.
    pub force: bool,
    /// Variables stripped from spawned task environments.
    pub env_denylist: Vec<String>,
    pub default_timeout_ms: Option<u64>,
    /// Grace window between a cancel/timeout signal and the kill.
    pub grace_ms: u64,
    pub hash_concurrency: usize,
    pub hash_batch_size: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            force: false,
            env_denylist: Vec::new(),
            default_timeout_ms: None,
            grace_ms: 5000,
            hash_concurrency: 8,
            hash_batch_size: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: TaskId,
    pub state: TaskState,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Build-wide counters. `leaf_initial_up_to_date` is a snapshot taken before
/// dispatch and is the stable denominator for progress; freshness discovered
/// during execution is counted separately.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildCounters {
    pub total_leaf_tasks: usize,
    pub leaf_initial_up_to_date: usize,
    pub leaf_built: usize,
    pub leaf_exec_time_up_to_date: usize,
    pub leaf_cache_restored: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BuildCounters {
    /// Tasks that did not run because of prior failures.
    pub fn skipped_due_to_failures(&self) -> usize {
        self.total_leaf_tasks
            .saturating_sub(self.leaf_initial_up_to_date)
            .saturating_sub(self.leaf_built)
            .saturating_sub(self.leaf_exec_time_up_to_date)
            .saturating_sub(self.failed)
    }
}

#[derive(Debug)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub summaries: Vec<TaskSummary>,
    pub counters: BuildCounters,
    pub store_stats: StoreStatsSnapshot,
    pub elapsed_ms: u64,
}

impl BuildResult {
    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskSummary> {
        self.summaries
            .iter()
            .filter(|summary| summary.state == TaskState::Failed)
    }
}

struct Completion {
    index: TaskIndex,
    outcome: TaskOutcome,
}

const INTERNAL_SENTINEL: TaskIndex = usize::MAX;

/// Shared with queue workers for the duration of one build.
struct JobShared {
    graph: Arc<BuildGraph>,
    workspace: Arc<Workspace>,
    context: Arc<BuildContext>,
    /// Cache key of each settled task; read by dependents' jobs.
    keys: Vec<Mutex<Option<String>>>,
    lockfile_hash: String,
    env_denylist: Vec<String>,
    default_timeout_ms: Option<u64>,
    grace_ms: u64,
    force: bool,
    cancel: CancelToken,
    tx: Sender<Completion>,
}

impl JobShared {
    fn ops(&self) -> TaskOps<'_> {
        TaskOps {
            graph: &self.graph,
            workspace: &self.workspace,
            context: &self.context,
            lockfile_hash: &self.lockfile_hash,
            env_denylist: &self.env_denylist,
            default_timeout_ms: self.default_timeout_ms,
            grace_ms: self.grace_ms,
            cancel: &self.cancel,
        }
    }
}

/// Scheduling bookkeeping owned by the executor's main loop.
struct LoopState {
    states: Vec<TaskState>,
    durations: Vec<u64>,
    errors: Vec<Option<String>>,
    unmet_hard: Vec<usize>,
    unmet_weak: Vec<usize>,
    remaining: usize,
    aborting: bool,
}

/// Drives one build of a [`BuildGraph`] to completion.
pub struct BuildExecutor {
    graph: Arc<BuildGraph>,
    workspace: Arc<Workspace>,
    context: Arc<BuildContext>,
    options: ExecutorOptions,
    cancel: CancelToken,
}

impl BuildExecutor {
    pub fn new(
        graph: Arc<BuildGraph>,
        workspace: Arc<Workspace>,
        context: Arc<BuildContext>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            graph,
            workspace,
            context,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Token observed by the queue and by in-flight task processes.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the full build: freshness pass, short-circuit, execution pass,
    /// reduction, finalization.
    pub fn execute_build(&self) -> Result<BuildResult> {
        let started = Instant::now();
        let count = self.graph.len();
        if count == 0 {
            return Ok(BuildResult {
                status: BuildStatus::UpToDate,
                summaries: Vec::new(),
                counters: BuildCounters::default(),
                store_stats: self.context.store.statistics(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let lockfile_hash = self.lockfile_hash()?;

        // Phase 1: freshness, bottom-up over hard edges.
        let (fresh, initial_keys) = self.up_to_date_pass(&lockfile_hash)?;

        let mut counters = BuildCounters {
            total_leaf_tasks: (0..count)
                .filter(|i| self.graph.task(*i).kind.is_leaf())
                .count(),
            leaf_initial_up_to_date: (0..count)
                .filter(|i| fresh[*i] && self.graph.task(*i).kind.is_leaf())
                .count(),
            ..BuildCounters::default()
        };

        self.context.events.emit(&BuildEvent::BuildStarted {
            total_tasks: counters.total_leaf_tasks,
            up_to_date: counters.leaf_initial_up_to_date,
        });

        // Phase 2: short-circuit when everything is fresh.
        if fresh.iter().all(|f| *f) {
            let summaries = (0..count)
                .map(|idx| TaskSummary {
                    id: self.graph.task(idx).id.clone(),
                    state: TaskState::UpToDate,
                    duration_ms: 0,
                    error: None,
                })
                .collect();
            let result = BuildResult {
                status: BuildStatus::UpToDate,
                summaries,
                counters,
                store_stats: self.context.store.statistics(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            self.finalize(&result);
            return Ok(result);
        }

        // Phase 3: execution.
        let shared_keys: Vec<Mutex<Option<String>>> = initial_keys
            .into_iter()
            .enumerate()
            .map(|(idx, key)| Mutex::new(if fresh[idx] { key } else { None }))
            .collect();

        let (tx, rx) = unbounded::<Completion>();
        let shared = Arc::new(JobShared {
            graph: Arc::clone(&self.graph),
            workspace: Arc::clone(&self.workspace),
            context: Arc::clone(&self.context),
            keys: shared_keys,
            lockfile_hash,
            env_denylist: self.options.env_denylist.clone(),
            default_timeout_ms: self.options.default_timeout_ms,
            grace_ms: self.options.grace_ms,
            force: self.options.force,
            cancel: self.cancel.clone(),
            tx: tx.clone(),
        });

        let job_shared = Arc::clone(&shared);
        let queue = PriorityTaskQueue::new(
            self.options.concurrency,
            Box::new(move |entry: QueueEntry| run_job(&job_shared, entry)),
        );
        let sentinel_tx = tx.clone();
        queue.on_error(Box::new(move |error| {
            let mut outcome = TaskOutcome::terminal(TaskState::Failed, None, 0);
            outcome.error = Some(error);
            let _ = sentinel_tx.send(Completion {
                index: INTERNAL_SENTINEL,
                outcome,
            });
        }));

        let (mut loop_state, internal_error) =
            self.execution_loop(&queue, &rx, &fresh, &shared, &mut counters);

        queue.wait_idle();
        queue.shutdown();
        drop(tx);

        if let Some(error) = internal_error {
            return Err(error);
        }

        let summaries: Vec<TaskSummary> = (0..count)
            .map(|idx| TaskSummary {
                id: self.graph.task(idx).id.clone(),
                state: loop_state.states[idx],
                duration_ms: loop_state.durations[idx],
                error: loop_state.errors[idx].take(),
            })
            .collect();

        let status = if counters.failed > 0 {
            BuildStatus::Failed
        } else if counters.leaf_built > 0 || counters.leaf_cache_restored > 0 {
            BuildStatus::Success
        } else {
            BuildStatus::UpToDate
        };

        let result = BuildResult {
            status,
            summaries,
            counters,
            store_stats: self.context.store.statistics(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.finalize(&result);
        Ok(result)
    }

    fn execution_loop(
        &self,
        queue: &PriorityTaskQueue,
        rx: &Receiver<Completion>,
        fresh: &[bool],
        shared: &Arc<JobShared>,
        counters: &mut BuildCounters,
    ) -> (LoopState, Option<Error>) {
        let count = self.graph.len();
        let mut ls = LoopState {
            states: vec![TaskState::NotStarted; count],
            durations: vec![0u64; count],
            errors: vec![None; count],
            unmet_hard: vec![0usize; count],
            unmet_weak: vec![0usize; count],
            remaining: 0,
            aborting: false,
        };
        let mut internal_error = None;

        for idx in 0..count {
            if fresh[idx] {
                ls.states[idx] = TaskState::UpToDate;
                continue;
            }
            ls.states[idx] = TaskState::QueuedPendingDeps;
            ls.remaining += 1;
            let node = self.graph.task(idx);
            // Fresh predecessors count as settled; for weak ordering a
            // cache-hit counts as "run".
            ls.unmet_hard[idx] = node.upstream_hard.iter().filter(|up| !fresh[**up]).count();
            ls.unmet_weak[idx] = node.upstream_weak.iter().filter(|up| !fresh[**up]).count();
        }

        for idx in 0..count {
            if ls.states[idx] == TaskState::QueuedPendingDeps
                && ls.unmet_hard[idx] == 0
                && ls.unmet_weak[idx] == 0
            {
                ls.states[idx] = TaskState::Ready;
                queue.push(self.entry(idx));
            }
        }

        while ls.remaining > 0 {
            let completion = match rx.recv() {
                Ok(completion) => completion,
                Err(_) => break,
            };

            if completion.index == INTERNAL_SENTINEL {
                internal_error = completion.outcome.error;
                self.abort_all(queue, &mut ls, counters);
                continue;
            }

            let idx = completion.index;
            let outcome = completion.outcome;
            ls.states[idx] = outcome.state;
            ls.durations[idx] = outcome.duration_ms;
            ls.errors[idx] = outcome.error.as_ref().map(|e| e.user_message());
            *shared.keys[idx].lock().unwrap() = outcome.cache_key.clone();
            ls.remaining -= 1;

            let is_leaf = self.graph.task(idx).kind.is_leaf();
            match outcome.state {
                TaskState::Succeeded if is_leaf => counters.leaf_built += 1,
                TaskState::UpToDate if is_leaf => counters.leaf_exec_time_up_to_date += 1,
                TaskState::CacheRestored if is_leaf => {
                    counters.leaf_cache_restored += 1;
                    counters.leaf_exec_time_up_to_date += 1;
                }
                TaskState::Failed => counters.failed += 1,
                _ => {}
            }

            self.context.events.emit(&BuildEvent::TaskFinished {
                id: self.graph.task(idx).id.clone(),
                state: outcome.state,
                duration_ms: outcome.duration_ms,
            });

            // Abort semantics: any failure (or a cancel) stops dispatch;
            // everything not yet started is skipped, in-flight tasks finish.
            if outcome.state == TaskState::Failed || self.cancel.is_cancelled() {
                self.abort_all(queue, &mut ls, counters);
                continue;
            }

            let node = self.graph.task(idx);
            for &downstream in &node.downstream_hard {
                if ls.states[downstream] == TaskState::QueuedPendingDeps {
                    ls.unmet_hard[downstream] -= 1;
                    self.maybe_dispatch(downstream, queue, &mut ls);
                }
            }
            for &downstream in &node.downstream_weak {
                if ls.states[downstream] == TaskState::QueuedPendingDeps {
                    ls.unmet_weak[downstream] -= 1;
                    self.maybe_dispatch(downstream, queue, &mut ls);
                }
            }
        }

        (ls, internal_error)
    }

    fn maybe_dispatch(&self, idx: TaskIndex, queue: &PriorityTaskQueue, ls: &mut LoopState) {
        if ls.states[idx] != TaskState::QueuedPendingDeps
            || ls.unmet_hard[idx] != 0
            || ls.unmet_weak[idx] != 0
        {
            return;
        }
        ls.states[idx] = TaskState::Ready;
        queue.push(self.entry(idx));
    }

    /// Skips every task that has not started: drained queue entries and all
    /// still-pending tasks. In-flight tasks run to completion.
    fn abort_all(&self, queue: &PriorityTaskQueue, ls: &mut LoopState, counters: &mut BuildCounters) {
        if ls.aborting {
            return;
        }
        ls.aborting = true;
        for entry in queue.abort() {
            self.skip(entry.index, ls, counters);
        }
        for idx in 0..ls.states.len() {
            if ls.states[idx] == TaskState::QueuedPendingDeps {
                self.skip(idx, ls, counters);
            }
        }
    }

    fn skip(&self, idx: TaskIndex, ls: &mut LoopState, counters: &mut BuildCounters) {
        if ls.states[idx].is_terminal() {
            return;
        }
        ls.states[idx] = TaskState::Skipped;
        ls.remaining -= 1;
        if self.graph.task(idx).kind.is_leaf() {
            counters.skipped += 1;
        }
        self.context.events.emit(&BuildEvent::TaskFinished {
            id: self.graph.task(idx).id.clone(),
            state: TaskState::Skipped,
            duration_ms: 0,
        });
    }

    fn entry(&self, idx: TaskIndex) -> QueueEntry {
        let node = self.graph.task(idx);
        QueueEntry {
            index: idx,
            priority: node.priority,
            id: node.id.clone(),
        }
    }

    /// Bottom-up freshness. Tasks are grouped by hard-edge depth; within a
    /// depth they are hashed in bounded batches to cap memory.
    fn up_to_date_pass(&self, lockfile_hash: &str) -> Result<(Vec<bool>, Vec<Option<String>>)> {
        let count = self.graph.len();
        let mut fresh = vec![false; count];
        let mut keys: Vec<Option<String>> = vec![None; count];
        if self.options.force {
            return Ok((fresh, keys));
        }

        let mut depth = vec![0usize; count];
        for &idx in self.graph.topological_order() {
            depth[idx] = self
                .graph
                .task(idx)
                .upstream_hard
                .iter()
                .map(|up| depth[*up] + 1)
                .max()
                .unwrap_or(0);
        }
        let max_depth = depth.iter().copied().max().unwrap_or(0);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.hash_concurrency.max(1))
            .thread_name(|i| format!("sail-hash-{}", i))
            .build()
            .map_err(|e| Error::internal(format!("failed to build hash pool: {}", e)))?;

        let ops = TaskOps {
            graph: &self.graph,
            workspace: &self.workspace,
            context: &self.context,
            lockfile_hash,
            env_denylist: &self.options.env_denylist,
            default_timeout_ms: self.options.default_timeout_ms,
            grace_ms: self.options.grace_ms,
            cancel: &self.cancel,
        };

        for level in 0..=max_depth {
            let level_tasks: Vec<TaskIndex> =
                (0..count).filter(|idx| depth[*idx] == level).collect();
            for batch in level_tasks.chunks(self.options.hash_batch_size.max(1)) {
                let results: Vec<(TaskIndex, Result<(bool, Option<String>)>)> = pool.install(|| {
                    use rayon::prelude::*;
                    batch
                        .par_iter()
                        .map(|&idx| (idx, self.freshness_of(&ops, idx, &fresh, &keys)))
                        .collect()
                });
                for (idx, result) in results {
                    // A hashing error here just means stale; if it persists,
                    // it surfaces as that task's failure during execution.
                    let (is_fresh, key) = result.unwrap_or_else(|error| {
                        tracing::debug!(
                            task = %self.graph.task(idx).id,
                            %error,
                            "freshness check errored, treating as stale"
                        );
                        (false, None)
                    });
                    fresh[idx] = is_fresh;
                    keys[idx] = key;
                }
            }
        }

        Ok((fresh, keys))
    }

    /// A task is fresh iff every hard predecessor is fresh and its own
    /// donefile records the current cache key with all outputs present.
    /// Store-only hits stay stale here; the execution pass restores them.
    fn freshness_of(
        &self,
        ops: &TaskOps<'_>,
        idx: TaskIndex,
        fresh: &[bool],
        keys: &[Option<String>],
    ) -> Result<(bool, Option<String>)> {
        let node = self.graph.task(idx);
        if !node.upstream_hard.iter().all(|up| fresh[*up]) {
            return Ok((false, None));
        }

        // A group's key folds its children only; a leaf's folds every hard
        // predecessor.
        let key_sources: &[TaskIndex] = if node.kind.is_leaf() {
            &node.upstream_hard
        } else {
            &node.children
        };
        let mut upstream_keys = Vec::with_capacity(key_sources.len());
        for up in key_sources {
            match &keys[*up] {
                Some(key) => upstream_keys.push(key.clone()),
                // An uncacheable predecessor poisons freshness downstream.
                None => return Ok((false, None)),
            }
        }

        let Some(key) = ops.compute_cache_key(idx, &upstream_keys)? else {
            return Ok((false, None));
        };
        let is_fresh = ops.donefile_fresh(node, &key);
        Ok((is_fresh, Some(key)))
    }

    fn lockfile_hash(&self) -> Result<String> {
        match &self.workspace.lockfile {
            Some(path) => self.context.file_hashes.hash(path),
            None => {
                tracing::warn!(root = %self.workspace.root.display(), "no lockfile found; cache keys omit it");
                Ok(String::new())
            }
        }
    }

    fn finalize(&self, result: &BuildResult) {
        if let Err(error) = self.context.file_hashes.persist() {
            tracing::warn!(%error, "failed to persist file hash cache");
        }
        self.context.events.emit(&BuildEvent::BuildFinished {
            status: result.status,
            elapsed_ms: result.elapsed_ms,
        });
    }
}

/// Body of one queue job: freshness re-check, cache restore, or execution.
/// Always sends exactly one completion.
fn run_job(shared: &Arc<JobShared>, entry: QueueEntry) {
    let idx = entry.index;
    shared.context.events.emit(&BuildEvent::TaskStarted {
        id: shared.graph.task(idx).id.clone(),
    });

    let outcome = run_task(shared, idx);
    let _ = shared.tx.send(Completion { index: idx, outcome });
}

fn run_task(shared: &Arc<JobShared>, idx: TaskIndex) -> TaskOutcome {
    let ops = shared.ops();
    let node = shared.graph.task(idx);

    // Group: all children are settled; fold their keys and finish.
    if !node.kind.is_leaf() {
        let mut child_keys = Vec::with_capacity(node.children.len());
        let mut all_present = !node.children.is_empty();
        for child in &node.children {
            match shared.keys[*child].lock().unwrap().clone() {
                Some(key) => child_keys.push(key),
                None => all_present = false,
            }
        }
        if all_present {
            return ops.finish_group(idx, &child_keys);
        }
        return TaskOutcome::terminal(TaskState::Succeeded, None, 0);
    }

    // Upstream keys: a keyless hard predecessor disables caching here too.
    let mut upstream_keys = Vec::with_capacity(node.upstream_hard.len());
    let mut cacheable = true;
    for up in &node.upstream_hard {
        match shared.keys[*up].lock().unwrap().clone() {
            Some(key) => upstream_keys.push(key),
            None => cacheable = false,
        }
    }

    let cache_key = if cacheable {
        match ops.compute_cache_key(idx, &upstream_keys) {
            Ok(key) => key,
            Err(error) => {
                let mut outcome = TaskOutcome::terminal(TaskState::Failed, None, 0);
                outcome.error = Some(error);
                return outcome;
            }
        }
    } else {
        None
    };

    if !shared.force {
        if let Some(key) = &cache_key {
            match ops.freshness(node, key) {
                Ok(Freshness::Local) => {
                    return TaskOutcome::terminal(TaskState::UpToDate, Some(key.clone()), 0);
                }
                Ok(Freshness::Shared) => match ops.restore_from_cache(idx, key) {
                    Ok(()) => {
                        return TaskOutcome::terminal(
                            TaskState::CacheRestored,
                            Some(key.clone()),
                            0,
                        );
                    }
                    Err(error) => {
                        // Invalidated entry: fall through and execute.
                        tracing::warn!(task = %node.id, %error, "cache restore failed, executing");
                    }
                },
                Ok(Freshness::Stale) => {}
                Err(error) => {
                    tracing::warn!(task = %node.id, %error, "freshness check failed, executing");
                }
            }
        }
    }

    ops.execute_leaf(idx, cache_key.as_deref())
}
