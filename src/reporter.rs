//! Structured progress notifications.
//!
//! The core never formats human-readable text itself; it emits
//! [`BuildEvent`]s to a [`Reporter`], and rendering is the consumer's
//! concern. [`ConsoleReporter`] is the rendering collaborator bundled
//! with the crate.

use std::sync::Mutex;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::rules::Phase;

/// Events emitted during resolution, rule application and execution.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    /// Dependency resolution started for a task.
    ResolveStarted { task: String },
    /// Dependency resolution completed for a task.
    ResolveCompleted { task: String, dependencies: usize },
    /// A rule phase opened.
    PhaseStarted { phase: Phase },
    /// A rule phase closed; no matching object has unapplied rules.
    PhaseCompleted { phase: Phase, rules_fired: usize },
    /// Plan execution started.
    ExecutionStarted { total: usize },
    TaskStarted { task: String },
    TaskCompleted { task: String, duration: Duration },
    TaskFailed { task: String, error: String },
    /// The task was not executed because a dependency failed. Reported
    /// distinctly from a failure.
    TaskSkipped { task: String, failed_dependency: String },
    ExecutionCompleted {
        completed: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Consumer of structured progress notifications.
pub trait Reporter: Send + Sync {
    fn event(&self, event: BuildEvent);
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn event(&self, _: BuildEvent) {}
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn event(&self, event: BuildEvent) {
        match &event {
            BuildEvent::TaskFailed { task, error } => {
                tracing::warn!(task, error, "task failed");
            }
            BuildEvent::TaskSkipped { task, failed_dependency } => {
                tracing::warn!(task, failed_dependency, "task skipped");
            }
            other => tracing::debug!(event = ?other, "build event"),
        }
    }
}

/// Renders execution progress with an `indicatif` bar.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reporter for ConsoleReporter {
    fn event(&self, event: BuildEvent) {
        let mut bar = self.bar.lock().unwrap();

        match event {
            BuildEvent::ExecutionStarted { total } => {
                let pb = ProgressBar::new(total as u64).with_style(
                    ProgressStyle::default_bar()
                        .template(
                            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                        )
                        .expect("invalid progress bar template")
                        .progress_chars("#>-"),
                );
                *bar = Some(pb);
            }
            BuildEvent::TaskStarted { task } => {
                if let Some(pb) = bar.as_ref() {
                    pb.set_message(task);
                }
            }
            BuildEvent::TaskCompleted { .. } => {
                if let Some(pb) = bar.as_ref() {
                    pb.inc(1);
                }
            }
            BuildEvent::TaskFailed { task, error } => {
                if let Some(pb) = bar.as_ref() {
                    pb.println(format!("{} {task}: {error}", style("failed").red()));
                    pb.inc(1);
                }
            }
            BuildEvent::TaskSkipped { task, failed_dependency } => {
                if let Some(pb) = bar.as_ref() {
                    pb.println(format!(
                        "{} {task} (dependency {failed_dependency} failed)",
                        style("skipped").yellow(),
                    ));
                    pb.inc(1);
                }
            }
            BuildEvent::ExecutionCompleted { completed, failed, skipped } => {
                if let Some(pb) = bar.take() {
                    pb.finish_with_message(format!(
                        "{completed} completed, {failed} failed, {skipped} skipped"
                    ));
                }
            }
            _ => {}
        }
    }
}
