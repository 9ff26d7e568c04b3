//! Task definition resolution: merging, reference expansion, cycle handling.

use std::collections::VecDeque;

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{BuildConfig, ScriptSpec, TaskDefinition};
use crate::error::{Error, Result};
use crate::package::{Package, PackageId};
use crate::refs::{TaskId, TaskRef};
use crate::workspace::Workspace;

/// What executing a task means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// Run the package script of the task's name.
    Script { command: String },
    /// Run an explicit command from the definition.
    Command { command: String },
    /// Aggregation task: succeeds iff all children succeed.
    Group,
}

impl TaskAction {
    pub fn command(&self) -> Option<&str> {
        match self {
            TaskAction::Script { command } | TaskAction::Command { command } => Some(command),
            TaskAction::Group => None,
        }
    }
}

/// A fully expanded (package, task) node ready for graph construction.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub id: TaskId,
    pub package: PackageId,
    pub task_name: String,
    pub definition: TaskDefinition,
    pub action: TaskAction,
    /// Hard upstream tasks: must reach a success terminal state first.
    pub depends_on: Vec<TaskId>,
    /// Group children; also hard upstream edges.
    pub children: Vec<TaskId>,
    /// Weak upstream tasks: ordering only, honored when both are scheduled.
    pub weak_upstream: Vec<TaskId>,
}

/// Output of resolution, in deterministic insertion order.
#[derive(Debug, Default)]
pub struct ResolvedTaskSet {
    pub tasks: IndexMap<TaskId, ResolvedTask>,
    /// Weak edges dropped because they would have closed a cycle.
    pub dropped_weak_edges: Vec<(TaskId, TaskId)>,
}

impl ResolvedTaskSet {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Expands workspace and per-package task definitions into a concrete task
/// set for the requested task names.
pub struct TaskDefinitionResolver<'a> {
    workspace: &'a Workspace,
    config: &'a BuildConfig,
}

impl<'a> TaskDefinitionResolver<'a> {
    pub fn new(workspace: &'a Workspace, config: &'a BuildConfig) -> Self {
        Self { workspace, config }
    }

    /// Resolves the requested task names across the selected packages.
    ///
    /// Hard references are expanded transitively; weak references are
    /// expanded only against the scheduled set afterwards. A cycle through
    /// hard edges is fatal; weak edges that would close a cycle are dropped
    /// with a warning.
    pub fn resolve(
        &self,
        packages: &[PackageId],
        requested: &[String],
    ) -> Result<ResolvedTaskSet> {
        let mut set = ResolvedTaskSet::default();
        let mut queue: VecDeque<(PackageId, String)> = VecDeque::new();
        let mut seen: FxHashSet<TaskId> = FxHashSet::default();

        for &pkg_id in packages {
            let package = self.workspace.package(pkg_id);
            for task_name in requested {
                // Packages that do not carry the task are skipped silently.
                if self.task_exists(package, task_name) {
                    let id = TaskId::new(&package.name, task_name);
                    if seen.insert(id.clone()) {
                        queue.push_back((pkg_id, task_name.clone()));
                    }
                }
            }
        }

        while let Some((pkg_id, task_name)) = queue.pop_front() {
            let resolved = self.resolve_one(pkg_id, &task_name)?;
            for target in resolved.depends_on.iter().chain(resolved.children.iter()) {
                if seen.insert(target.clone()) {
                    let dep_pkg = self
                        .workspace
                        .find(target.package())
                        .ok_or_else(|| Error::PackageNotFound {
                            name: target.package().to_string(),
                        })?;
                    queue.push_back((dep_pkg, target.task().to_string()));
                }
            }
            set.tasks.insert(resolved.id.clone(), resolved);
        }

        self.expand_weak_edges(&mut set);
        self.check_hard_cycles(&set)?;
        self.break_weak_cycles(&mut set);
        Ok(set)
    }

    /// Whether `task_name` is defined for `package`: a runnable script, an
    /// explicit command, or a group with at least one existing child.
    pub fn task_exists(&self, package: &Package, task_name: &str) -> bool {
        let mut visiting = Vec::new();
        self.task_exists_inner(package, task_name, &mut visiting)
    }

    fn task_exists_inner(
        &self,
        package: &Package,
        task_name: &str,
        visiting: &mut Vec<String>,
    ) -> bool {
        if visiting.iter().any(|name| name == task_name) {
            return false;
        }
        let Some(definition) = self.config.definition_for(package, task_name) else {
            return false;
        };
        match &definition.script {
            ScriptSpec::Command(_) => true,
            ScriptSpec::Script(true) => package.get_script(task_name).is_some(),
            ScriptSpec::Script(false) => {
                visiting.push(task_name.to_string());
                let any = definition
                    .children
                    .iter()
                    .any(|child| self.task_exists_inner(package, child, visiting));
                visiting.pop();
                any
            }
        }
    }

    fn resolve_one(&self, pkg_id: PackageId, task_name: &str) -> Result<ResolvedTask> {
        let package = self.workspace.package(pkg_id);
        let id = TaskId::new(&package.name, task_name);
        let definition = self
            .config
            .definition_for(package, task_name)
            .ok_or_else(|| Error::TaskNotFound {
                package: package.name.clone(),
                task: task_name.to_string(),
                available: available_tasks(package),
            })?;

        let action = match &definition.script {
            ScriptSpec::Command(command) => TaskAction::Command {
                command: command.clone(),
            },
            ScriptSpec::Script(false) => TaskAction::Group,
            ScriptSpec::Script(true) => {
                let command = package.get_script(task_name).ok_or_else(|| {
                    Error::MissingScript {
                        package: package.name.clone(),
                        task: task_name.to_string(),
                        script: task_name.to_string(),
                    }
                })?;
                TaskAction::Script {
                    command: command.to_string(),
                }
            }
        };

        let mut depends_on = Vec::new();
        for raw in &definition.depends_on {
            let parsed = TaskRef::parse(raw)?;
            if parsed.weak_only() {
                return Err(Error::config(format!(
                    "'{}' is only valid in before/after (task {})",
                    raw, id
                )));
            }
            self.expand_hard_ref(&id, pkg_id, &parsed, &mut depends_on)?;
        }

        let mut children = Vec::new();
        if action == TaskAction::Group {
            for child in &definition.children {
                if self.task_exists(package, child) {
                    children.push(TaskId::new(&package.name, child));
                }
            }
        }

        dedup_in_place(&mut depends_on);
        dedup_in_place(&mut children);

        Ok(ResolvedTask {
            id,
            package: pkg_id,
            task_name: task_name.to_string(),
            definition,
            action,
            depends_on,
            children,
            weak_upstream: Vec::new(),
        })
    }

    fn expand_hard_ref(
        &self,
        from: &TaskId,
        pkg_id: PackageId,
        reference: &TaskRef,
        out: &mut Vec<TaskId>,
    ) -> Result<()> {
        let package = self.workspace.package(pkg_id);
        match reference {
            TaskRef::Own(name) => {
                // Workspace-level definitions apply to heterogeneous
                // packages; a missing same-package task creates no edge.
                if self.task_exists(package, name) {
                    out.push(TaskId::new(&package.name, name));
                }
            }
            TaskRef::Dependencies(name) => {
                for dep_id in self.workspace.internal_dependencies(pkg_id) {
                    let dep = self.workspace.package(dep_id);
                    if self.task_exists(dep, name) {
                        out.push(TaskId::new(&dep.name, name));
                    }
                }
            }
            TaskRef::Package { package: target, task } => {
                let target_id =
                    self.workspace
                        .find(target)
                        .ok_or_else(|| Error::UnknownTaskReference {
                            reference: reference.to_string(),
                            task_id: from.to_string(),
                        })?;
                let target_pkg = self.workspace.package(target_id);
                if !self.task_exists(target_pkg, task) {
                    return Err(Error::UnknownTaskReference {
                        reference: reference.to_string(),
                        task_id: from.to_string(),
                    });
                }
                out.push(TaskId::new(&target_pkg.name, task));
            }
            TaskRef::ReleaseGroup(name) => {
                let Some(group) = package.release_group.as_deref() else {
                    return Ok(());
                };
                for sibling_id in self.workspace.release_group(group) {
                    if *sibling_id == pkg_id {
                        continue;
                    }
                    let sibling = self.workspace.package(*sibling_id);
                    if self.task_exists(sibling, name) {
                        out.push(TaskId::new(&sibling.name, name));
                    }
                }
            }
            TaskRef::All => unreachable!("weak-only refs rejected above"),
        }
        Ok(())
    }

    /// Expands `before`/`after` against the scheduled set. Unresolved weak
    /// references are dropped.
    fn expand_weak_edges(&self, set: &mut ResolvedTaskSet) {
        let scheduled: FxHashSet<TaskId> = set.tasks.keys().cloned().collect();
        let ids: Vec<TaskId> = set.tasks.keys().cloned().collect();

        let mut additions: FxHashMap<TaskId, Vec<TaskId>> = FxHashMap::default();
        for id in &ids {
            let task = &set.tasks[id];
            let pkg_id = task.package;

            // `before: [X]` orders this task ahead of X.
            for raw in task.definition.before.clone() {
                for target in self.expand_weak_ref(&raw, pkg_id, id, &scheduled) {
                    additions.entry(target).or_default().push(id.clone());
                }
            }
            // `after: [X]` orders this task behind X.
            for raw in task.definition.after.clone() {
                for target in self.expand_weak_ref(&raw, pkg_id, id, &scheduled) {
                    additions.entry(id.clone()).or_default().push(target);
                }
            }
        }

        for (downstream, upstreams) in additions {
            let task = set
                .tasks
                .get_mut(&downstream)
                .expect("weak targets are scheduled");
            for upstream in upstreams {
                if upstream != downstream && !task.weak_upstream.contains(&upstream) {
                    task.weak_upstream.push(upstream);
                }
            }
            task.weak_upstream.sort();
        }
    }

    fn expand_weak_ref(
        &self,
        raw: &str,
        pkg_id: PackageId,
        own_id: &TaskId,
        scheduled: &FxHashSet<TaskId>,
    ) -> Vec<TaskId> {
        let package = self.workspace.package(pkg_id);
        let Ok(parsed) = TaskRef::parse(raw) else {
            tracing::warn!(task = %own_id, reference = raw, "dropping malformed weak reference");
            return Vec::new();
        };

        let candidates: Vec<TaskId> = match parsed {
            TaskRef::Own(name) => vec![TaskId::new(&package.name, &name)],
            TaskRef::All => scheduled
                .iter()
                .filter(|id| id.package() == package.name && *id != own_id)
                .cloned()
                .collect(),
            TaskRef::Dependencies(name) => self
                .workspace
                .internal_dependencies(pkg_id)
                .into_iter()
                .map(|dep| TaskId::new(&self.workspace.package(dep).name, &name))
                .collect(),
            TaskRef::Package { package, task } => vec![TaskId::new(&package, &task)],
            TaskRef::ReleaseGroup(name) => match package.release_group.as_deref() {
                Some(group) => self
                    .workspace
                    .release_group(group)
                    .iter()
                    .filter(|sibling| **sibling != pkg_id)
                    .map(|sibling| TaskId::new(&self.workspace.package(*sibling).name, &name))
                    .collect(),
                None => Vec::new(),
            },
        };

        let mut matched: Vec<TaskId> = candidates
            .into_iter()
            .filter(|id| scheduled.contains(id))
            .collect();
        matched.sort();
        matched
    }

    /// Hard edges (dependsOn and group children) must be acyclic.
    fn check_hard_cycles(&self, set: &ResolvedTaskSet) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let mut marks: FxHashMap<&TaskId, Mark> =
            set.tasks.keys().map(|id| (id, Mark::White)).collect();

        fn visit<'t>(
            id: &'t TaskId,
            set: &'t ResolvedTaskSet,
            marks: &mut FxHashMap<&'t TaskId, Mark>,
            stack: &mut Vec<&'t TaskId>,
        ) -> Result<()> {
            match marks.get(id).copied() {
                Some(Mark::Black) => return Ok(()),
                Some(Mark::Grey) => {
                    let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                    let chain: Vec<String> = stack[start..]
                        .iter()
                        .map(|s| s.to_string())
                        .chain(std::iter::once(id.to_string()))
                        .collect();
                    return Err(Error::CircularTaskDependency {
                        chain: chain.join(" -> "),
                    });
                }
                _ => {}
            }
            marks.insert(id, Mark::Grey);
            stack.push(id);
            let task = &set.tasks[id];
            for upstream in task.depends_on.iter().chain(task.children.iter()) {
                if set.tasks.contains_key(upstream) {
                    visit(upstream, set, marks, stack)?;
                }
            }
            stack.pop();
            marks.insert(id, Mark::Black);
            Ok(())
        }

        let mut stack = Vec::new();
        for id in set.tasks.keys() {
            visit(id, set, &mut marks, &mut stack)?;
        }
        Ok(())
    }

    /// Drops weak edges that would close a cycle over the combined graph.
    fn break_weak_cycles(&self, set: &mut ResolvedTaskSet) {
        let ids: Vec<TaskId> = set.tasks.keys().cloned().collect();
        let mut accepted: FxHashMap<TaskId, Vec<TaskId>> = FxHashMap::default();
        let mut dropped = Vec::new();

        for id in &ids {
            let weak = std::mem::take(&mut set.tasks.get_mut(id).unwrap().weak_upstream);
            for upstream in weak {
                if reaches(set, &accepted, id, &upstream) || upstream == *id {
                    tracing::warn!(
                        downstream = %id,
                        upstream = %upstream,
                        "dropping weak ordering edge that would create a cycle"
                    );
                    dropped.push((upstream, id.clone()));
                } else {
                    accepted.entry(id.clone()).or_default().push(upstream);
                }
            }
        }

        for (id, upstreams) in accepted {
            set.tasks.get_mut(&id).unwrap().weak_upstream = upstreams;
        }
        set.dropped_weak_edges = dropped;

        // `from` transitively precedes `to` over hard plus accepted weak edges.
        fn reaches(
            set: &ResolvedTaskSet,
            accepted: &FxHashMap<TaskId, Vec<TaskId>>,
            from: &TaskId,
            to: &TaskId,
        ) -> bool {
            let mut stack = vec![to.clone()];
            let mut visited = FxHashSet::default();
            while let Some(current) = stack.pop() {
                if current == *from {
                    return true;
                }
                if !visited.insert(current.clone()) {
                    continue;
                }
                if let Some(task) = set.tasks.get(&current) {
                    for upstream in task.depends_on.iter().chain(task.children.iter()) {
                        stack.push(upstream.clone());
                    }
                }
                if let Some(weak) = accepted.get(&current) {
                    for upstream in weak {
                        stack.push(upstream.clone());
                    }
                }
            }
            false
        }
    }
}

fn available_tasks(package: &Package) -> String {
    let names: Vec<&str> = package.scripts.keys().map(String::as_str).collect();
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

fn dedup_in_place(ids: &mut Vec<TaskId>) {
    let mut seen = FxHashSet::default();
    ids.retain(|id| seen.insert(id.clone()));
}
