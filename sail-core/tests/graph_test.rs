//! Build graph wiring: arena indices, priorities, roots.

use std::path::PathBuf;

use indexmap::IndexMap;
use smallvec::SmallVec;

use sail_core::{
    BuildConfig, BuildGraph, DependencyResolver, Package, PackageFilter, TaskDefinitionResolver,
    TaskId, TaskKind, TaskRegistry, Workspace,
};

fn package(name: &str, deps: &[&str], scripts: &[(&str, &str)]) -> Package {
    Package {
        name: name.to_string(),
        directory: PathBuf::from("/repo").join(name),
        version: Some("1.0.0".to_string()),
        scripts: scripts
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        dependencies: deps
            .iter()
            .map(|d| (d.to_string(), "*".to_string()))
            .collect::<SmallVec<_>>(),
        release_group: None,
        task_overrides: IndexMap::new(),
    }
}

fn diamond_graph() -> (Workspace, BuildConfig, BuildGraph) {
    let workspace = Workspace::new(
        PathBuf::from("/repo"),
        vec![
            package("utils", &[], &[("build", "echo utils")]),
            package("lib-a", &["utils"], &[("build", "echo a")]),
            package("lib-b", &["utils"], &[("build", "echo b")]),
            package("app", &["lib-a", "lib-b"], &[("build", "echo app")]),
        ],
        None,
    )
    .unwrap();
    let config: BuildConfig = serde_json::from_str(
        r#"{
            "version": 1,
            "tasks": {
                "build": {
                    "dependsOn": ["^build"],
                    "inputGlobs": ["src/**"],
                    "outputGlobs": ["dist/**"]
                }
            }
        }"#,
    )
    .unwrap();

    let package_graph = DependencyResolver::resolve(&workspace, &PackageFilter::all()).unwrap();
    let resolved = TaskDefinitionResolver::new(&workspace, &config)
        .resolve(package_graph.matched(), &["build".to_string()])
        .unwrap();
    let registry = TaskRegistry::new();
    let graph =
        BuildGraph::build(&workspace, &package_graph, &resolved, &registry, &config).unwrap();
    (workspace, config, graph)
}

#[test]
fn test_arena_and_edges() {
    let (_, _, graph) = diamond_graph();
    assert_eq!(graph.len(), 4);

    let app = graph.index_of(&TaskId::new("app", "build")).unwrap();
    let node = graph.task(app);
    assert_eq!(node.upstream_hard.len(), 2);
    assert!(node.kind.is_leaf());

    let utils = graph.index_of(&TaskId::new("utils", "build")).unwrap();
    assert_eq!(graph.task(utils).downstream_hard.len(), 2);
}

#[test]
fn test_root_tasks_have_no_incoming_hard_edges() {
    let (_, _, graph) = diamond_graph();
    let roots = graph.root_tasks();
    assert_eq!(roots.len(), 1);
    assert_eq!(graph.task(roots[0]).id, TaskId::new("app", "build"));
}

#[test]
fn test_topological_order_respects_hard_edges() {
    let (_, _, graph) = diamond_graph();
    let order = graph.topological_order();
    let position = |id: &TaskId| {
        order
            .iter()
            .position(|idx| &graph.task(*idx).id == id)
            .unwrap()
    };
    assert!(position(&TaskId::new("utils", "build")) < position(&TaskId::new("lib-a", "build")));
    assert!(position(&TaskId::new("lib-b", "build")) < position(&TaskId::new("app", "build")));
}

#[test]
fn test_priorities_track_level_and_dependents() {
    let (_, _, graph) = diamond_graph();
    let utils = graph.task(graph.index_of(&TaskId::new("utils", "build")).unwrap());
    let app = graph.task(graph.index_of(&TaskId::new("app", "build")).unwrap());

    assert_eq!(utils.priority.level, 1);
    assert_eq!(utils.priority.dependents, 3);
    assert_eq!(app.priority.level, 3);
    assert_eq!(app.priority.dependents, 0);
}

#[test]
fn test_buildable_packages_cover_scheduled_tasks() {
    let (workspace, _, graph) = diamond_graph();
    let names: Vec<&str> = graph
        .buildable_packages()
        .iter()
        .map(|id| workspace.package(*id).name.as_str())
        .collect();
    assert_eq!(names.len(), 4);
    for name in ["utils", "lib-a", "lib-b", "app"] {
        assert!(names.contains(&name));
    }
}

#[test]
fn test_leaf_spec_carries_plan() {
    let (_, _, graph) = diamond_graph();
    let utils = graph.task(graph.index_of(&TaskId::new("utils", "build")).unwrap());
    match &utils.kind {
        TaskKind::Leaf(spec) => {
            assert_eq!(spec.command, "echo utils");
            assert_eq!(spec.input_globs, vec!["src/**".to_string()]);
            assert!(spec.caching.is_enabled());
        }
        TaskKind::Group => panic!("expected a leaf"),
    }
}
