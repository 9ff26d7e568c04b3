//! Task runtime: state machine, freshness checks, execution, cache tee.

use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::build_graph::{BuildGraph, LeafSpec, TaskIndex, TaskKind, TaskNode};
use crate::cache_key::CacheKey;
use crate::context::{BuildContext, CancelToken};
use crate::error::{Error, Result};
use crate::globs::FileSpec;
use crate::store::{file_mode, OutputFile};
use crate::worker::WorkerRequest;
use crate::workspace::Workspace;

const DONEFILE_VERSION: u32 = 1;

/// Lifecycle of a task within one build. Transitions are monotonic except
/// the initial `NotStarted -> QueuedPendingDeps -> Ready` ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    NotStarted,
    QueuedPendingDeps,
    Ready,
    Running,
    Succeeded,
    /// Donefile matched the current cache key.
    UpToDate,
    /// Outputs were materialized from the shared store.
    CacheRestored,
    Failed,
    /// An ancestor failed, or the build was aborted before this task ran.
    Skipped,
}

impl TaskState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::UpToDate
                | TaskState::CacheRestored
                | TaskState::Failed
                | TaskState::Skipped
        )
    }

    #[inline]
    pub fn is_success(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::UpToDate | TaskState::CacheRestored
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::NotStarted => "not started",
            TaskState::QueuedPendingDeps => "queued",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::UpToDate => "up to date",
            TaskState::CacheRestored => "cache restored",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        }
    }
}

/// How a task turned out to be fresh, if it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Donefile records the current cache key and all its outputs exist.
    Local,
    /// The shared store holds the cache key.
    Shared,
    Stale,
}

/// Marker written next to a package on a task's success path. Records the
/// cache key and the outputs it produced, so missing outputs invalidate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donefile {
    pub version: u32,
    pub cache_key: String,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Result of running one task to a terminal state.
#[derive(Debug)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub cache_key: Option<String>,
    pub duration_ms: u64,
    pub error: Option<Error>,
    pub stdout: String,
    pub stderr: String,
}

impl TaskOutcome {
    pub fn terminal(state: TaskState, cache_key: Option<String>, duration_ms: u64) -> Self {
        Self {
            state,
            cache_key,
            duration_ms,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Per-build task operations: cache keys, donefiles, freshness, execution.
///
/// Holds shared references only; one value is used concurrently from every
/// queue worker.
pub struct TaskOps<'a> {
    pub graph: &'a BuildGraph,
    pub workspace: &'a Workspace,
    pub context: &'a BuildContext,
    pub lockfile_hash: &'a str,
    pub env_denylist: &'a [String],
    pub default_timeout_ms: Option<u64>,
    pub grace_ms: u64,
    pub cancel: &'a CancelToken,
}

impl<'a> TaskOps<'a> {
    /// Computes the cache key digest for a task given its upstream keys.
    ///
    /// Returns `None` for leaves whose handler disabled caching; such tasks
    /// are never fresh and never populate the store. Group keys hash the
    /// child keys.
    pub fn compute_cache_key(
        &self,
        idx: TaskIndex,
        upstream_keys: &[String],
    ) -> Result<Option<String>> {
        let node = self.graph.task(idx);
        let spec = match &node.kind {
            TaskKind::Group => {
                return Ok(Some(CacheKey::group_digest(upstream_keys)));
            }
            TaskKind::Leaf(spec) => spec,
        };
        if !spec.caching.is_enabled() {
            return Ok(None);
        }

        let package = self.workspace.package(node.package);
        let inputs = FileSpec::new(&spec.input_globs)?;
        let files = inputs.collect(&package.directory)?;

        let mut builder = CacheKey::builder()
            .command(&spec.command)
            .lockfile_hash(self.lockfile_hash);
        if let Some(tool) = &spec.tool_version {
            builder = builder.tool_version(tool.clone());
        }
        for rel in files {
            let abs = package.directory.join(&rel);
            let hash = self.context.file_hashes.hash_with_mode(&abs, spec.text)?;
            builder = builder.input(rel.to_string_lossy().replace('\\', "/"), hash);
        }
        for key in upstream_keys {
            builder = builder.upstream_key(key.clone());
        }
        for name in &spec.env_keys {
            builder = builder.env_var(name.clone(), std::env::var(name).ok());
        }
        Ok(Some(builder.build()?.digest()))
    }

    pub fn read_donefile(&self, node: &TaskNode) -> Option<Donefile> {
        let package = self.workspace.package(node.package);
        let raw = std::fs::read_to_string(package.donefile_path(&node.task_name)).ok()?;
        let donefile: Donefile = serde_json::from_str(&raw).ok()?;
        (donefile.version == DONEFILE_VERSION).then_some(donefile)
    }

    /// Donefiles are written atomically and only on a task's success path.
    pub fn write_donefile(&self, node: &TaskNode, cache_key: &str, outputs: &[String]) -> Result<()> {
        let package = self.workspace.package(node.package);
        let path = package.donefile_path(&node.task_name);
        let donefile = Donefile {
            version: DONEFILE_VERSION,
            cache_key: cache_key.to_string(),
            outputs: outputs.to_vec(),
        };
        let raw = serde_json::to_vec(&donefile)
            .map_err(|e| Error::internal(format!("failed to serialize donefile: {}", e)))?;
        let tmp = path.with_extension("donefile.tmp");
        std::fs::write(&tmp, raw).map_err(|e| Error::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        Ok(())
    }

    pub fn clear_donefile(&self, node: &TaskNode) {
        let package = self.workspace.package(node.package);
        let _ = std::fs::remove_file(package.donefile_path(&node.task_name));
    }

    /// Local freshness only: the donefile records `cache_key` and every
    /// output it lists still exists. The up-to-date pass uses this; store
    /// hits are left for the execution pass to restore.
    pub fn donefile_fresh(&self, node: &TaskNode, cache_key: &str) -> bool {
        let Some(donefile) = self.read_donefile(node) else {
            return false;
        };
        if donefile.cache_key != cache_key {
            return false;
        }
        let package = self.workspace.package(node.package);
        donefile
            .outputs
            .iter()
            .all(|rel| package.directory.join(rel).is_file())
    }

    /// Full freshness: donefile first, then the shared store.
    pub fn freshness(&self, node: &TaskNode, cache_key: &str) -> Result<Freshness> {
        if self.donefile_fresh(node, cache_key) {
            return Ok(Freshness::Local);
        }
        if node.kind.is_leaf() && self.context.store.lookup(cache_key)?.is_some() {
            return Ok(Freshness::Shared);
        }
        Ok(Freshness::Stale)
    }

    /// Materializes outputs for `cache_key` into the package directory and
    /// records the donefile.
    pub fn restore_from_cache(&self, idx: TaskIndex, cache_key: &str) -> Result<()> {
        let node = self.graph.task(idx);
        let package = self.workspace.package(node.package);
        let manifest = self.context.store.restore(cache_key, &package.directory)?;
        let outputs: Vec<String> = manifest
            .outputs
            .iter()
            .map(|entry| entry.rel_path.clone())
            .collect();
        self.write_donefile(node, cache_key, &outputs)
    }

    /// Runs a leaf task to completion: spawn, capture, tee outputs into the
    /// store, record the donefile. The donefile is removed on failure so a
    /// later build cannot consider the task fresh.
    pub fn execute_leaf(&self, idx: TaskIndex, cache_key: Option<&str>) -> TaskOutcome {
        let node = self.graph.task(idx);
        let spec = match &node.kind {
            TaskKind::Leaf(spec) => spec,
            TaskKind::Group => {
                let mut outcome = TaskOutcome::terminal(TaskState::Failed, None, 0);
                outcome.error = Some(Error::internal(format!(
                    "group task {} dispatched as leaf",
                    node.id
                )));
                return outcome;
            }
        };

        let started = Instant::now();
        let run = self.spawn_command(node, spec);
        let duration_ms = started.elapsed().as_millis() as u64;

        match run {
            Ok(run) if run.exit_code == 0 => {
                if let Some(key) = cache_key {
                    if let Err(error) = self.record_success(node, spec, key) {
                        tracing::warn!(task = %node.id, %error, "task succeeded but cache record failed");
                    }
                }
                TaskOutcome {
                    state: TaskState::Succeeded,
                    cache_key: cache_key.map(str::to_string),
                    duration_ms,
                    error: None,
                    stdout: run.stdout,
                    stderr: run.stderr,
                }
            }
            Ok(run) => {
                self.clear_donefile(node);
                TaskOutcome {
                    state: TaskState::Failed,
                    cache_key: None,
                    duration_ms,
                    error: Some(Error::TaskFailed {
                        task_id: node.id.to_string(),
                        code: Some(run.exit_code),
                        stderr: truncate(&run.stderr, 4000),
                    }),
                    stdout: run.stdout,
                    stderr: run.stderr,
                }
            }
            Err(error) => {
                self.clear_donefile(node);
                TaskOutcome {
                    state: TaskState::Failed,
                    cache_key: None,
                    duration_ms,
                    error: Some(error),
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        }
    }

    fn record_success(&self, node: &TaskNode, spec: &LeafSpec, cache_key: &str) -> Result<()> {
        let outputs = self.collect_outputs(node, spec)?;
        let package = self.workspace.package(node.package);
        self.context
            .store
            .store(cache_key, &package.directory, &outputs)?;
        let rel_paths: Vec<String> = outputs
            .iter()
            .map(|o| o.rel_path.to_string_lossy().replace('\\', "/"))
            .collect();
        self.write_donefile(node, cache_key, &rel_paths)
    }

    /// Identifies produced outputs from the declared globs.
    pub fn collect_outputs(&self, node: &TaskNode, spec: &LeafSpec) -> Result<Vec<OutputFile>> {
        if spec.output_globs.is_empty() {
            return Ok(Vec::new());
        }
        let package = self.workspace.package(node.package);
        let outputs = FileSpec::new(&spec.output_globs)?;
        let mut collected = Vec::new();
        for rel in outputs.collect(&package.directory)? {
            let abs = package.directory.join(&rel);
            let bytes = std::fs::read(&abs).map_err(|e| Error::io(&abs, e))?;
            collected.push(OutputFile {
                rel_path: rel.clone(),
                hash: crate::hashing::hash_bytes(&bytes),
                mode: file_mode(&abs),
            });
        }
        Ok(collected)
    }

    fn spawn_command(&self, node: &TaskNode, spec: &LeafSpec) -> Result<RunOutput> {
        if let Some(pool) = &self.context.worker_pool {
            let package = self.workspace.package(node.package);
            let request = WorkerRequest {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), spec.command.clone()],
                cwd: package.directory.clone(),
                env: self.task_env(),
            };
            match pool.submit(&request) {
                Ok(response) => {
                    return Ok(RunOutput {
                        exit_code: response.exit_code,
                        stdout: response.stdout,
                        stderr: response.stderr,
                    });
                }
                Err(error) if error.is_retryable() => {
                    // Worker IPC failures fall back to a direct spawn, once.
                    tracing::warn!(task = %node.id, %error, "worker pool failed, spawning directly");
                }
                Err(error) => return Err(error),
            }
        }

        self.spawn_direct(node, spec)
    }

    fn task_env(&self) -> BTreeMap<String, String> {
        std::env::vars()
            .filter(|(name, _)| !self.env_denylist.contains(name))
            .collect()
    }

    fn spawn_direct(&self, node: &TaskNode, spec: &LeafSpec) -> Result<RunOutput> {
        let timeout_ms = spec.timeout_ms.or(self.default_timeout_ms);
        let package = self.workspace.package(node.package);
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&package.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for name in self.env_denylist {
            command.env_remove(name);
        }

        let mut child = command.spawn().map_err(|e| Error::TaskFailed {
            task_id: node.id.to_string(),
            code: None,
            stderr: format!("failed to spawn: {}", e),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_handle = std::thread::spawn(move || read_all(stdout));
        let stderr_handle = std::thread::spawn(move || read_all(stderr));

        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    return Err(Error::io(&package.directory, e));
                }
            }

            let killed_by = if self.cancel.is_cancelled() {
                Some(Killed::Cancel)
            } else if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                Some(Killed::Timeout)
            } else {
                None
            };

            if let Some(reason) = killed_by {
                // Grace window, then the process is killed.
                std::thread::sleep(Duration::from_millis(self.grace_ms.min(250)));
                if child.try_wait().ok().flatten().is_none() {
                    let _ = child.kill();
                }
                let _ = child.wait();
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(match reason {
                    Killed::Timeout => Error::TaskTimeout {
                        task_id: node.id.to_string(),
                        timeout_ms: timeout_ms.unwrap_or(0),
                    },
                    Killed::Cancel => Error::TaskFailed {
                        task_id: node.id.to_string(),
                        code: None,
                        stderr: "cancelled".to_string(),
                    },
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let status = child.wait().map_err(|e| Error::io(&package.directory, e))?;
        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        Ok(RunOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Terminal outcome for a group once all children are terminal.
    pub fn finish_group(&self, idx: TaskIndex, child_keys: &[String]) -> TaskOutcome {
        let node = self.graph.task(idx);
        let key = CacheKey::group_digest(child_keys);
        if let Err(error) = self.write_donefile(node, &key, &[]) {
            tracing::debug!(task = %node.id, %error, "group donefile write failed");
        }
        TaskOutcome::terminal(TaskState::Succeeded, Some(key), 0)
    }
}

#[derive(Debug, Clone, Copy)]
enum Killed {
    Timeout,
    Cancel,
}

struct RunOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

fn read_all(stream: Option<impl Read>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_terminality() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::UpToDate.is_terminal());
        assert!(TaskState::CacheRestored.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Ready.is_terminal());
    }

    #[test]
    fn test_success_states() {
        assert!(TaskState::UpToDate.is_success());
        assert!(TaskState::CacheRestored.is_success());
        assert!(!TaskState::Skipped.is_success());
        assert!(!TaskState::Failed.is_success());
    }

    #[test]
    fn test_donefile_roundtrip_serde() {
        let donefile = Donefile {
            version: DONEFILE_VERSION,
            cache_key: "abc".to_string(),
            outputs: vec!["dist/a.js".to_string()],
        };
        let raw = serde_json::to_string(&donefile).unwrap();
        let parsed: Donefile = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.cache_key, "abc");
        assert_eq!(parsed.outputs.len(), 1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let cut = truncate(text, 2);
        assert!(cut.starts_with('h'));
    }
}
