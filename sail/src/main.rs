mod commands;
mod reporter;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "sail")]
#[command(about = "Incremental monorepo build orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace root; defaults to the current directory.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(short, long, action, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build tasks across the workspace, reusing cached outputs.
    Build {
        /// Regex selecting packages by name; everything when omitted.
        pattern: Option<String>,
        /// Task name to run; repeatable. Defaults to "build".
        #[arg(short, long = "task")]
        tasks: Vec<String>,
        /// Restrict selection to one release group.
        #[arg(long)]
        release_group: Option<String>,
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
        /// Default per-task timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Environment variable withheld from task processes; repeatable.
        #[arg(long = "env-deny")]
        env_denylist: Vec<String>,
        /// Dispatch commands through the reusable worker pool.
        #[arg(long, action)]
        worker: bool,
        /// Ignore donefiles and cache hits; run everything.
        #[arg(long, action)]
        force: bool,
        /// Skip the package-manager install check.
        #[arg(long, action)]
        skip_install_check: bool,
    },
    /// Print the discovered workspace, packages, and task graph.
    Scan {
        dir: Option<PathBuf>,
        /// Infer tasks from scripts without loading configuration.
        #[arg(long, action)]
        infer: bool,
        #[arg(long, action)]
        json: bool,
    },
    /// Serve the worker protocol on stdio (spawned by the worker pool).
    #[command(hide = true)]
    Worker,
}

fn init_tracing(verbose: u8, quiet: bool) {
    // DEBUG=sail:* is honored alongside the standard env filter.
    let debug_env = std::env::var("DEBUG").unwrap_or_default();
    let default_level = if quiet {
        "error"
    } else if debug_env.starts_with("sail") {
        "sail=debug,sail_core=debug"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_env("SAIL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let exit_code = match cli.command {
        Commands::Build {
            pattern,
            tasks,
            release_group,
            concurrency,
            timeout_ms,
            env_denylist,
            worker,
            force,
            skip_install_check,
        } => commands::cmd_build(commands::BuildArgs {
            dir: cli.dir,
            pattern,
            tasks,
            release_group,
            concurrency,
            timeout_ms,
            env_denylist,
            worker,
            force,
            skip_install_check,
            quiet: cli.quiet,
        })?,
        Commands::Scan { dir, infer, json } => {
            commands::cmd_scan(dir.unwrap_or(cli.dir), infer, json)?
        }
        Commands::Worker => commands::cmd_worker()?,
    };

    std::process::exit(exit_code);
}
