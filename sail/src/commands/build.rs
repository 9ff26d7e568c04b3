//! The `build` command: discover, resolve, execute, summarize.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use regex::Regex;

use sail_core::{
    BuildConfig, BuildContext, BuildExecutor, BuildGraph, BuildStatus, ContextOptions,
    DependencyResolver, ExecutorOptions, LockfilePresenceCheck, PackageFilter,
    PackageManagerAdapter, TaskDefinitionResolver, WorkerPoolConfig, WorkspaceAdapter,
    WorkspaceScanner,
};

use crate::reporter::{print_summary, ProgressReporter};

pub struct BuildArgs {
    pub dir: PathBuf,
    pub pattern: Option<String>,
    pub tasks: Vec<String>,
    pub release_group: Option<String>,
    pub concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub env_denylist: Vec<String>,
    pub worker: bool,
    pub force: bool,
    pub skip_install_check: bool,
    pub quiet: bool,
}

pub fn cmd_build(args: BuildArgs) -> Result<i32> {
    let requested: Vec<String> = if args.tasks.is_empty() {
        vec!["build".to_string()]
    } else {
        args.tasks.clone()
    };

    let workspace = Arc::new(WorkspaceScanner::default().discover(&args.dir)?);
    if workspace.is_empty() {
        println!("no tasks");
        return Ok(0);
    }
    workspace.validate_internal_ranges();

    if !args.skip_install_check {
        let current = LockfilePresenceCheck.check_install(&workspace)?;
        if !current {
            return Err(anyhow!(
                "dependencies are not installed; run your package manager first"
            ));
        }
    }

    let config = BuildConfig::load(&workspace.root)?;
    let filter = PackageFilter {
        name_regex: args.pattern.as_deref().map(Regex::new).transpose()?,
        release_group: args.release_group.clone(),
        explicit: None,
    };
    let package_graph = DependencyResolver::resolve(&workspace, &filter)?;

    let resolver = TaskDefinitionResolver::new(&workspace, &config);
    let resolved = resolver.resolve(package_graph.matched(), &requested)?;
    if resolved.is_empty() {
        return Err(sail_core::Error::NoMatchedTasks {
            requested: requested.join(", "),
        }
        .into());
    }

    let context = BuildContext::new(context_options(&workspace.root, args.worker)?)?;
    let graph = Arc::new(BuildGraph::build(
        &workspace,
        &package_graph,
        &resolved,
        &context.registry,
        &config,
    )?);

    let reporter = ProgressReporter::new(args.quiet);
    let context = Arc::new(context.with_events(Box::new(reporter)));

    let mut options = ExecutorOptions::default();
    if let Some(concurrency) = args.concurrency {
        options.concurrency = concurrency.max(1);
    }
    options.force = args.force;
    options.default_timeout_ms = args.timeout_ms;
    options.env_denylist = args.env_denylist.clone();

    let executor = BuildExecutor::new(
        Arc::clone(&graph),
        Arc::clone(&workspace),
        Arc::clone(&context),
        options,
    );

    let cancel = executor.cancel_token();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, finishing in-flight tasks");
        cancel.cancel();
    })?;

    let result = executor.execute_build()?;
    print_summary(&result, args.quiet);

    match result.status {
        BuildStatus::Failed => Ok(1),
        BuildStatus::Success | BuildStatus::UpToDate => Ok(0),
    }
}

fn context_options(root: &std::path::Path, use_worker: bool) -> Result<ContextOptions> {
    let mut options = ContextOptions::from_env(root);
    if use_worker {
        let program = std::env::current_exe()?;
        let mut pool = WorkerPoolConfig::new(program, vec!["worker".to_string()]);
        if let Ok(count) = std::env::var("SAIL_WORKER_COUNT") {
            if let Ok(count) = count.parse::<usize>() {
                pool.size = count.max(1);
            }
        }
        options.worker_pool = Some(pool);
    }
    Ok(options)
}
