//! The `scan` command: print the discovered workspace and task graph.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};
use owo_colors::OwoColorize;

use sail_core::{
    BuildConfig, DependencyResolver, PackageFilter, TaskDefinitionResolver, WorkspaceAdapter,
    WorkspaceScanner,
};

pub fn cmd_scan(dir: PathBuf, infer: bool, json: bool) -> Result<i32> {
    let workspace = WorkspaceScanner::default().discover(&dir)?;
    if workspace.is_empty() {
        println!("no packages found under {}", dir.display());
        return Ok(0);
    }

    let config = if infer {
        BuildConfig::default()
    } else {
        BuildConfig::load(&workspace.root)?
    };
    let package_graph = DependencyResolver::resolve(&workspace, &PackageFilter::all())?;

    if json {
        let rendered = serde_json::json!({
            "root": workspace.root,
            "lockfile": workspace.lockfile,
            "packages": workspace.packages(),
        });
        println!("{}", serde_json::to_string_pretty(&rendered)?);
        return Ok(0);
    }

    println!(
        "{} {}",
        "workspace".bold(),
        workspace.root.display().to_string().bright_black()
    );
    match &workspace.lockfile {
        Some(lockfile) => println!(
            "lockfile: {}",
            lockfile
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ),
        None => println!("lockfile: {}", "missing".yellow()),
    }
    println!();

    let mut table = Table::new();
    table
        .set_header(vec![
            Cell::new("Package"),
            Cell::new("Version"),
            Cell::new("Level"),
            Cell::new("Release group"),
            Cell::new("Scripts"),
        ])
        .load_preset(comfy_table::presets::UTF8_FULL)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);

    for id in workspace.ids() {
        let package = workspace.package(id);
        table.add_row(vec![
            Cell::new(&package.name),
            Cell::new(package.version.as_deref().unwrap_or("-")),
            Cell::new(package_graph.level(id)),
            Cell::new(package.release_group.as_deref().unwrap_or("-")),
            Cell::new(package.scripts.len()),
        ]);
    }
    println!("{}", table);
    println!();

    // Task graph: every script name across the workspace, fully expanded.
    let mut task_names: Vec<String> = workspace
        .packages()
        .iter()
        .flat_map(|p| p.scripts.keys().cloned())
        .collect();
    task_names.sort();
    task_names.dedup();

    let resolver = TaskDefinitionResolver::new(&workspace, &config);
    let resolved = resolver.resolve(package_graph.matched(), &task_names)?;
    println!("{} ({} tasks)", "task graph".bold(), resolved.tasks.len());
    for task in resolved.tasks.values() {
        let mut line = format!("  {}", task.id);
        if !task.depends_on.is_empty() {
            let deps: Vec<String> = task.depends_on.iter().map(|d| d.to_string()).collect();
            line.push_str(&format!(" <- {}", deps.join(", ")));
        }
        if !task.children.is_empty() {
            let children: Vec<String> = task.children.iter().map(|c| c.to_string()).collect();
            line.push_str(&format!(" [children: {}]", children.join(", ")));
        }
        println!("{}", line);
    }

    Ok(0)
}
