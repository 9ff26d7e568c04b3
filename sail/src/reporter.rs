//! Terminal reporter subscribed to the engine's event stream.

use std::sync::Mutex;

use comfy_table::{Cell, Table};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

use sail_core::{BuildEvent, BuildResult, BuildStatus, EventSink, TaskState};

/// Renders a progress bar from task events. The stable denominator is the
/// pre-execution snapshot carried by `BuildStarted`.
pub struct ProgressReporter {
    quiet: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressReporter {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            bar: Mutex::new(None),
        }
    }
}

impl EventSink for ProgressReporter {
    fn emit(&self, event: &BuildEvent) {
        if self.quiet {
            return;
        }
        match event {
            BuildEvent::BuildStarted {
                total_tasks,
                up_to_date,
            } => {
                let pending = total_tasks.saturating_sub(*up_to_date) as u64;
                if pending == 0 {
                    return;
                }
                let bar = ProgressBar::new(pending);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{spinner} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                *self.bar.lock().unwrap() = Some(bar);
            }
            BuildEvent::TaskStarted { id } => {
                if let Some(bar) = self.bar.lock().unwrap().as_ref() {
                    bar.set_message(id.to_string());
                }
            }
            BuildEvent::TaskFinished { id, state, .. } => {
                if let Some(bar) = self.bar.lock().unwrap().as_ref() {
                    bar.inc(1);
                    if *state == TaskState::Failed {
                        bar.println(format!("{} {}", "failed".red().bold(), id));
                    }
                }
            }
            BuildEvent::BuildFinished { .. } => {
                if let Some(bar) = self.bar.lock().unwrap().take() {
                    bar.finish_and_clear();
                }
            }
        }
    }
}

/// Prints the final result: per-task failures, cache statistics, timings.
pub fn print_summary(result: &BuildResult, quiet: bool) {
    match result.status {
        BuildStatus::UpToDate => {
            println!("{} nothing to do", "up to date".bright_black());
            return;
        }
        BuildStatus::Success => {
            if quiet {
                return;
            }
            println!(
                "{} {} built, {} restored, {} already current ({} ms)",
                "success".green().bold(),
                result.counters.leaf_built,
                result.counters.leaf_cache_restored,
                result.counters.leaf_initial_up_to_date,
                result.elapsed_ms
            );
            let stats = result.store_stats;
            println!(
                "cache: {} hits, {} misses, {} stores{}",
                stats.hits,
                stats.misses,
                stats.stores,
                if stats.corrupted > 0 {
                    format!(", {} corrupt entries swept", stats.corrupted)
                } else {
                    String::new()
                }
            );
            if !quiet {
                print_timings(result);
            }
        }
        BuildStatus::Failed => {
            let mut table = Table::new();
            table
                .set_header(vec![Cell::new("Task"), Cell::new("Error")])
                .load_preset(comfy_table::presets::UTF8_FULL)
                .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
            for failed in result.failed_tasks() {
                table.add_row(vec![
                    Cell::new(failed.id.to_string()).fg(comfy_table::Color::Red),
                    Cell::new(failed.error.as_deref().unwrap_or("unknown error")),
                ]);
            }
            eprintln!("{}", table);
            eprintln!(
                "{} {} failed, {} did not run due to prior failures",
                "failed".red().bold(),
                result.counters.failed,
                result.counters.skipped_due_to_failures()
            );
        }
    }
}

fn print_timings(result: &BuildResult) {
    let mut timed: Vec<_> = result
        .summaries
        .iter()
        .filter(|s| s.state == TaskState::Succeeded && s.duration_ms > 0)
        .collect();
    timed.sort_by_key(|s| std::cmp::Reverse(s.duration_ms));
    for summary in timed.iter().take(10) {
        println!(
            "  {:>7} ms  {}",
            summary.duration_ms,
            summary.id.to_string().bright_black()
        );
    }
}
