//! Package-level dependency resolution.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::package::{Package, PackageId};
use crate::workspace::Workspace;

/// Package selection applied *after* full graph resolution, so transitive
/// dependents of matched packages remain reachable by the executor.
#[derive(Debug, Default, Clone)]
pub struct PackageFilter {
    pub name_regex: Option<Regex>,
    pub release_group: Option<String>,
    pub explicit: Option<Vec<String>>,
}

impl PackageFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, package: &Package) -> bool {
        if let Some(regex) = &self.name_regex {
            if !regex.is_match(&package.name) {
                return false;
            }
        }
        if let Some(group) = &self.release_group {
            if package.release_group.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        if let Some(names) = &self.explicit {
            if !names.iter().any(|name| name == &package.name) {
                return false;
            }
        }
        true
    }
}

/// The package DAG with topological levels.
///
/// Edges point from a package to its dependencies, matching the declaration
/// direction in manifests.
#[derive(Debug)]
pub struct PackageGraph {
    graph: DiGraph<PackageId, ()>,
    node_of: Vec<NodeIndex>,
    levels: Vec<u32>,
    topological: Vec<PackageId>,
    matched: Vec<PackageId>,
}

impl PackageGraph {
    /// Topological level: `1 + max(level of dependencies)`, `1` for leaves.
    #[inline]
    pub fn level(&self, id: PackageId) -> u32 {
        self.levels[id.index()]
    }

    /// Packages selected by the filter, in discovery order.
    pub fn matched(&self) -> &[PackageId] {
        &self.matched
    }

    /// All packages, dependencies before dependents.
    pub fn topological_order(&self) -> &[PackageId] {
        &self.topological
    }

    pub fn dependencies(&self, id: PackageId) -> Vec<PackageId> {
        self.graph
            .neighbors_directed(self.node_of[id.index()], Direction::Outgoing)
            .map(|node| self.graph[node])
            .collect()
    }

    pub fn dependents(&self, id: PackageId) -> Vec<PackageId> {
        self.graph
            .neighbors_directed(self.node_of[id.index()], Direction::Incoming)
            .map(|node| self.graph[node])
            .collect()
    }
}

/// Builds the package DAG from workspace metadata.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Resolves the workspace into a leveled DAG.
    ///
    /// # Errors
    ///
    /// Returns a `Dependency` error naming every member of a dependency
    /// cycle.
    pub fn resolve(workspace: &Workspace, filter: &PackageFilter) -> Result<PackageGraph> {
        let count = workspace.len();
        let mut graph = DiGraph::with_capacity(count, count * 2);
        let mut node_of = Vec::with_capacity(count);

        for id in workspace.ids() {
            node_of.push(graph.add_node(id));
        }
        for id in workspace.ids() {
            for dep in workspace.internal_dependencies(id) {
                graph.add_edge(node_of[id.index()], node_of[dep.index()], ());
            }
        }

        // Tarjan's SCC: any component larger than one node (or a self-edge)
        // is a dependency cycle and fatal.
        for component in tarjan_scc(&graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .map(|node| graph.contains_edge(*node, *node))
                    .unwrap_or(false);
            if cyclic {
                let mut names: Vec<String> = component
                    .iter()
                    .map(|node| workspace.package(graph[*node]).name.clone())
                    .collect();
                names.sort();
                return Err(Error::CircularPackageDependency {
                    chain: names.join(" -> "),
                });
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let name = &workspace.package(graph[cycle.node_id()]).name;
            Error::CircularPackageDependency { chain: name.clone() }
        })?;
        let topological: Vec<PackageId> =
            sorted.into_iter().rev().map(|node| graph[node]).collect();

        let mut levels = vec![0u32; count];
        let mut level_by_id: FxHashMap<PackageId, u32> = FxHashMap::default();
        for &id in &topological {
            let dep_max = graph
                .neighbors_directed(node_of[id.index()], Direction::Outgoing)
                .map(|node| level_by_id.get(&graph[node]).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            let level = dep_max + 1;
            levels[id.index()] = level;
            level_by_id.insert(id, level);
        }

        let matched: Vec<PackageId> = workspace
            .ids()
            .filter(|id| filter.matches(workspace.package(*id)))
            .collect();

        Ok(PackageGraph {
            graph,
            node_of,
            levels,
            topological,
            matched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Package;
    use indexmap::IndexMap;
    use smallvec::SmallVec;
    use std::path::PathBuf;

    fn package(name: &str, deps: &[&str]) -> Package {
        Package {
            name: name.to_string(),
            directory: PathBuf::from("/repo").join(name),
            version: None,
            scripts: IndexMap::new(),
            dependencies: deps
                .iter()
                .map(|d| (d.to_string(), "*".to_string()))
                .collect::<SmallVec<_>>(),
            release_group: None,
            task_overrides: IndexMap::new(),
        }
    }

    fn diamond() -> Workspace {
        Workspace::new(
            PathBuf::from("/repo"),
            vec![
                package("utils", &[]),
                package("lib-a", &["utils"]),
                package("lib-b", &["utils"]),
                package("app", &["lib-a", "lib-b"]),
            ],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_levels() {
        let workspace = diamond();
        let graph = DependencyResolver::resolve(&workspace, &PackageFilter::all()).unwrap();
        assert_eq!(graph.level(workspace.find("utils").unwrap()), 1);
        assert_eq!(graph.level(workspace.find("lib-a").unwrap()), 2);
        assert_eq!(graph.level(workspace.find("lib-b").unwrap()), 2);
        assert_eq!(graph.level(workspace.find("app").unwrap()), 3);
    }

    #[test]
    fn test_topological_order_dependencies_first() {
        let workspace = diamond();
        let graph = DependencyResolver::resolve(&workspace, &PackageFilter::all()).unwrap();
        let order = graph.topological_order();
        let pos = |name: &str| {
            order
                .iter()
                .position(|id| workspace.package(*id).name == name)
                .unwrap()
        };
        assert!(pos("utils") < pos("lib-a"));
        assert!(pos("utils") < pos("lib-b"));
        assert!(pos("lib-a") < pos("app"));
    }

    #[test]
    fn test_cycle_names_every_member() {
        let workspace = Workspace::new(
            PathBuf::from("/repo"),
            vec![
                package("a", &["b"]),
                package("b", &["c"]),
                package("c", &["a"]),
            ],
            None,
        )
        .unwrap();
        let err = DependencyResolver::resolve(&workspace, &PackageFilter::all()).unwrap_err();
        let message = err.to_string();
        for name in ["a", "b", "c"] {
            assert!(message.contains(name), "missing {} in {}", name, message);
        }
    }

    #[test]
    fn test_filter_applied_after_resolution() {
        let workspace = diamond();
        let filter = PackageFilter {
            name_regex: Some(Regex::new("^lib-").unwrap()),
            ..PackageFilter::all()
        };
        let graph = DependencyResolver::resolve(&workspace, &filter).unwrap();
        assert_eq!(graph.matched().len(), 2);
        // Unmatched packages keep their levels for transitive scheduling.
        assert_eq!(graph.level(workspace.find("app").unwrap()), 3);
    }

    #[test]
    fn test_explicit_filter() {
        let workspace = diamond();
        let filter = PackageFilter {
            explicit: Some(vec!["app".to_string()]),
            ..PackageFilter::all()
        };
        let graph = DependencyResolver::resolve(&workspace, &filter).unwrap();
        assert_eq!(graph.matched().len(), 1);
    }
}
