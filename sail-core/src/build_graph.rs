//! Build graph construction: task arena, edge wiring, priorities.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::BuildConfig;
use crate::definitions::{ResolvedTaskSet, TaskAction};
use crate::error::{Error, Result};
use crate::package::PackageId;
use crate::refs::TaskId;
use crate::registry::{CachingMode, TaskRegistry};
use crate::resolver::PackageGraph;
use crate::workspace::Workspace;

/// Index into the build graph's flat task arena. Tasks reference each other
/// by index; nothing holds a pointer into the arena.
pub type TaskIndex = usize;

/// Scheduling priority, compared lexicographically: package level, then
/// transitive dependent count, then declared weight. Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority {
    pub level: u32,
    pub dependents: u32,
    pub weight: u32,
}

/// Execution recipe for a leaf task.
#[derive(Debug, Clone)]
pub struct LeafSpec {
    pub command: String,
    pub input_globs: Vec<String>,
    pub output_globs: Vec<String>,
    pub tool_version: Option<String>,
    /// Declared environment variables hashed into the cache key.
    pub env_keys: Vec<String>,
    pub text: bool,
    pub timeout_ms: Option<u64>,
    pub caching: CachingMode,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    Leaf(LeafSpec),
    Group,
}

impl TaskKind {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, TaskKind::Leaf(_))
    }
}

/// A node in the build graph. Immutable once the graph is built; runtime
/// state lives with the executor.
#[derive(Debug)]
pub struct TaskNode {
    pub id: TaskId,
    pub package: PackageId,
    pub task_name: String,
    pub kind: TaskKind,
    /// Hard predecessors (dependsOn plus group children).
    pub upstream_hard: Vec<TaskIndex>,
    /// Weak predecessors (before/after ordering).
    pub upstream_weak: Vec<TaskIndex>,
    pub downstream_hard: Vec<TaskIndex>,
    pub downstream_weak: Vec<TaskIndex>,
    /// Children of a group task; empty for leaves.
    pub children: Vec<TaskIndex>,
    pub priority: Priority,
}

/// The materialized task graph for one build.
#[derive(Debug)]
pub struct BuildGraph {
    tasks: Vec<TaskNode>,
    index_of: FxHashMap<TaskId, TaskIndex>,
    root_tasks: Vec<TaskIndex>,
    buildable_packages: Vec<PackageId>,
    /// Every task index, hard-edge dependencies before dependents.
    topological: Vec<TaskIndex>,
}

impl BuildGraph {
    /// Materializes tasks from a resolved task set and wires all edges.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unresolved hard references or a
    /// hard-edge cycle (both argue a bug upstream in resolution, but the
    /// graph revalidates before executing anything).
    pub fn build(
        workspace: &Workspace,
        package_graph: &PackageGraph,
        resolved: &ResolvedTaskSet,
        registry: &TaskRegistry,
        config: &BuildConfig,
    ) -> Result<BuildGraph> {
        let count = resolved.tasks.len();
        let mut index_of = FxHashMap::with_capacity_and_hasher(count, Default::default());
        for (idx, id) in resolved.tasks.keys().enumerate() {
            index_of.insert(id.clone(), idx);
        }

        let mut tasks = Vec::with_capacity(count);
        for (id, task) in resolved.tasks.iter() {
            let kind = match &task.action {
                TaskAction::Group => TaskKind::Group,
                action => {
                    let command = action.command().expect("leaf actions carry a command");
                    let plan = registry.plan(command, &task.definition, config);
                    TaskKind::Leaf(LeafSpec {
                        command: command.to_string(),
                        input_globs: plan.input_globs,
                        output_globs: plan.output_globs,
                        tool_version: plan.tool_version,
                        env_keys: task.definition.env.clone(),
                        text: task.definition.text,
                        timeout_ms: task.definition.timeout_ms,
                        caching: plan.caching,
                    })
                }
            };

            let resolve_edge = |target: &TaskId| -> Result<TaskIndex> {
                index_of.get(target).copied().ok_or_else(|| {
                    Error::UnknownTaskReference {
                        reference: target.to_string(),
                        task_id: id.to_string(),
                    }
                })
            };

            let mut upstream_hard = Vec::new();
            for target in task.depends_on.iter().chain(task.children.iter()) {
                let target_idx = resolve_edge(target)?;
                if !upstream_hard.contains(&target_idx) {
                    upstream_hard.push(target_idx);
                }
            }
            // Weak references to tasks outside the scheduled set are dropped.
            let upstream_weak: Vec<TaskIndex> = task
                .weak_upstream
                .iter()
                .filter_map(|target| index_of.get(target).copied())
                .collect();
            let children: Vec<TaskIndex> = task
                .children
                .iter()
                .filter_map(|target| index_of.get(target).copied())
                .collect();

            tasks.push(TaskNode {
                id: id.clone(),
                package: task.package,
                task_name: task.task_name.clone(),
                kind,
                upstream_hard,
                upstream_weak,
                downstream_hard: Vec::new(),
                downstream_weak: Vec::new(),
                children,
                priority: Priority {
                    level: 0,
                    dependents: 0,
                    weight: task.definition.weight,
                },
            });
        }

        for idx in 0..tasks.len() {
            let hard = tasks[idx].upstream_hard.clone();
            for upstream in hard {
                tasks[upstream].downstream_hard.push(idx);
            }
            let weak = tasks[idx].upstream_weak.clone();
            for upstream in weak {
                tasks[upstream].downstream_weak.push(idx);
            }
        }

        let topological = hard_topological_order(&tasks)?;

        for idx in 0..tasks.len() {
            tasks[idx].priority.level = package_graph.level(tasks[idx].package);
            tasks[idx].priority.dependents = transitive_dependents(&tasks, idx);
        }

        let root_tasks: Vec<TaskIndex> = (0..tasks.len())
            .filter(|idx| tasks[*idx].downstream_hard.is_empty())
            .collect();

        let mut buildable_packages: Vec<PackageId> = tasks.iter().map(|t| t.package).collect();
        buildable_packages.sort();
        buildable_packages.dedup();

        Ok(BuildGraph {
            tasks,
            index_of,
            root_tasks,
            buildable_packages,
            topological,
        })
    }

    #[inline]
    pub fn task(&self, idx: TaskIndex) -> &TaskNode {
        &self.tasks[idx]
    }

    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn index_of(&self, id: &TaskId) -> Option<TaskIndex> {
        self.index_of.get(id).copied()
    }

    /// Tasks with no incoming hard edges.
    pub fn root_tasks(&self) -> &[TaskIndex] {
        &self.root_tasks
    }

    pub fn buildable_packages(&self) -> &[PackageId] {
        &self.buildable_packages
    }

    /// All tasks, hard dependencies before dependents.
    pub fn topological_order(&self) -> &[TaskIndex] {
        &self.topological
    }
}

/// Kahn's algorithm over hard edges; doubles as the acyclicity validation.
fn hard_topological_order(tasks: &[TaskNode]) -> Result<Vec<TaskIndex>> {
    let mut in_degree: Vec<usize> = tasks.iter().map(|t| t.upstream_hard.len()).collect();
    let mut ready: Vec<TaskIndex> = (0..tasks.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(idx) = ready.pop() {
        order.push(idx);
        for &downstream in &tasks[idx].downstream_hard {
            in_degree[downstream] -= 1;
            if in_degree[downstream] == 0 {
                ready.push(downstream);
            }
        }
    }

    if order.len() != tasks.len() {
        let mut stuck: Vec<String> = (0..tasks.len())
            .filter(|i| in_degree[*i] > 0)
            .map(|i| tasks[i].id.to_string())
            .collect();
        stuck.sort();
        return Err(Error::CircularTaskDependency {
            chain: stuck.join(" -> "),
        });
    }
    Ok(order)
}

fn transitive_dependents(tasks: &[TaskNode], start: TaskIndex) -> u32 {
    let mut visited = FxHashSet::default();
    let mut stack: Vec<TaskIndex> = tasks[start].downstream_hard.clone();
    while let Some(idx) = stack.pop() {
        if visited.insert(idx) {
            stack.extend(tasks[idx].downstream_hard.iter().copied());
        }
    }
    visited.len() as u32
}
