//! Walks an [`ExecutionPlan`] with a thread pool.
//!
//! Tasks are executed as soon as their dependencies are met:
//! 1. A pool of worker threads is spawned.
//! 2. A channel carries results back to the scheduler thread.
//! 3. The initial set of tasks (those with no dependencies) is spawned.
//! 4. When a task completes, the dependency counts of its dependents
//!    are decremented; a count reaching zero spawns the dependent.
//! 5. When a task fails, its transitive dependents are skipped, not
//!    executed, and the skip is reported distinctly from the failure.
//!    Sibling branches of the plan keep running.
//!
//! No retries happen here; whether to re-attempt a failed task is the
//! invoker's policy.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;

use crate::error::GantryError;
use crate::plan::ExecutionPlan;
use crate::reporter::{BuildEvent, Reporter};
use crate::task::{TaskCx, TaskSpec};

/// Wall-clock timing of one executed task.
#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Outcome of walking a plan. Failures and skips are collected rather
/// than aborting the walk, so sibling branches always run to the end.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub completed: Vec<String>,
    /// `(task, error)` pairs for tasks whose action failed.
    pub failed: Vec<(String, String)>,
    /// `(task, failed dependency)` pairs for tasks that were never
    /// executed because a dependency failed.
    pub skipped: Vec<(String, String)>,
    pub timings: HashMap<String, TaskExecution>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

pub(crate) fn run_plan(
    plan: &ExecutionPlan,
    tasks: &HashMap<String, TaskSpec>,
    reporter: &dyn Reporter,
    threads: Option<usize>,
) -> Result<ExecutionReport, GantryError> {
    let total = plan.len();
    let mut report = ExecutionReport::default();

    if total == 0 {
        return Ok(report);
    }

    let position: HashMap<&str, usize> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| (step.task.as_str(), index))
        .collect();

    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut dependency_counts: Vec<usize> = vec![0; total];

    for (index, step) in plan.steps.iter().enumerate() {
        dependency_counts[index] = step.depends_on.len();
        for dep in &step.depends_on {
            dependents
                .entry(position[dep.as_str()])
                .or_default()
                .push(index);
        }
    }

    reporter.event(BuildEvent::ExecutionStarted { total });

    // 0 worker threads means the rayon default (one per core).
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.unwrap_or(0))
        .build()?;

    let (result_tx, result_rx) = unbounded::<(usize, Instant, Duration, Result<(), String>)>();

    let mut state = vec![NodeState::Pending; total];

    // The scheduler loop must stay on the calling thread; a plain
    // `scope` would run it on a pool worker, and with a pool of one
    // thread nothing would be left to execute tasks.
    pool.in_place_scope(|s| {
        let spawn_task = |index: usize| {
            let step = &plan.steps[index];
            let spec = tasks.get(&step.task);

            let name = step.task.clone();
            let action = spec.and_then(|spec| spec.action.clone());
            let inputs = spec.map(|spec| spec.inputs.clone()).unwrap_or_default();
            let outputs = spec.map(|spec| spec.outputs.clone()).unwrap_or_default();
            let sender = result_tx.clone();

            s.spawn(move |_| {
                let start = Instant::now();

                let result = match &action {
                    Some(action) => {
                        let cx = TaskCx {
                            name: &name,
                            inputs: &inputs,
                            outputs: &outputs,
                        };
                        action(&cx).map_err(|error| format!("{error:#}"))
                    }
                    // Tasks without an action are pure ordering nodes.
                    None => Ok(()),
                };

                sender.send((index, start, start.elapsed(), result)).unwrap();
            });
        };

        // Seed initial tasks
        for index in 0..total {
            if dependency_counts[index] == 0 {
                state[index] = NodeState::Running;
                reporter.event(BuildEvent::TaskStarted {
                    task: plan.steps[index].task.clone(),
                });
                spawn_task(index);
            }
        }

        // Scheduler loop; the main thread sits here while the pool
        // executes tasks.
        let mut processed = 0;
        while processed < total {
            let (index, start, duration, result) = result_rx.recv().unwrap();
            processed += 1;

            let name = plan.steps[index].task.clone();
            report.timings.insert(name.clone(), TaskExecution { start, duration });

            match result {
                Ok(()) => {
                    state[index] = NodeState::Completed;
                    report.completed.push(name.clone());
                    reporter.event(BuildEvent::TaskCompleted { task: name, duration });

                    for &dependent in dependents.get(&index).into_iter().flatten() {
                        dependency_counts[dependent] -= 1;
                        if dependency_counts[dependent] == 0
                            && state[dependent] == NodeState::Pending
                        {
                            state[dependent] = NodeState::Running;
                            reporter.event(BuildEvent::TaskStarted {
                                task: plan.steps[dependent].task.clone(),
                            });
                            spawn_task(dependent);
                        }
                    }
                }
                Err(error) => {
                    state[index] = NodeState::Failed;
                    report.failed.push((name.clone(), error.clone()));
                    tracing::warn!(task = name, error, "task failed");
                    reporter.event(BuildEvent::TaskFailed { task: name.clone(), error });

                    // Skip dependents transitively, attributing every
                    // skip to the task that originally failed.
                    let mut worklist = vec![index];
                    while let Some(current) = worklist.pop() {
                        for &dependent in dependents.get(&current).into_iter().flatten() {
                            if state[dependent] == NodeState::Pending {
                                state[dependent] = NodeState::Skipped;
                                processed += 1;

                                let skipped = plan.steps[dependent].task.clone();
                                report.skipped.push((skipped.clone(), name.clone()));
                                reporter.event(BuildEvent::TaskSkipped {
                                    task: skipped,
                                    failed_dependency: name.clone(),
                                });
                                worklist.push(dependent);
                            }
                        }
                    }
                }
            }
        }
    });

    reporter.event(BuildEvent::ExecutionCompleted {
        completed: report.completed.len(),
        failed: report.failed.len(),
        skipped: report.skipped.len(),
    });

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::graph::GraphBuilder;
    use crate::reporter::NoopReporter;

    fn build_plan(specs: &[TaskSpec], goals: &[&str]) -> (ExecutionPlan, HashMap<String, TaskSpec>) {
        let mut builder = GraphBuilder::new();
        let mut map = HashMap::new();

        for spec in specs {
            map.insert(spec.name.clone(), spec.clone());
            builder.register(spec.clone()).unwrap();
        }
        for goal in goals {
            builder.add_goal(*goal);
        }

        (builder.build(&NoopReporter).unwrap(), map)
    }

    #[test]
    fn dependencies_complete_before_dependents_start() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let record = |log: &Arc<Mutex<Vec<String>>>, name: &str| {
            let log = log.clone();
            let name = name.to_string();
            move |_: &TaskCx| {
                log.lock().unwrap().push(name.clone());
                Ok(())
            }
        };

        let specs = vec![
            TaskSpec::new("compile").run(record(&log, "compile")),
            TaskSpec::new("link").depends_on("compile").run(record(&log, "link")),
            TaskSpec::new("package").depends_on("link").run(record(&log, "package")),
        ];

        let (plan, tasks) = build_plan(&specs, &["package"]);
        let report = run_plan(&plan, &tasks, &NoopReporter, Some(4)).unwrap();

        assert!(report.success());
        assert_eq!(*log.lock().unwrap(), ["compile", "link", "package"]);
        assert!(report.timings.contains_key("link"));
    }

    #[test]
    fn failure_skips_dependents_but_not_siblings() {
        let sibling_ran = Arc::new(Mutex::new(false));
        let flag = sibling_ran.clone();

        let specs = vec![
            TaskSpec::new("broken").run(|_| anyhow::bail!("no compiler")),
            TaskSpec::new("dependent").depends_on("broken"),
            TaskSpec::new("transitive").depends_on("dependent"),
            TaskSpec::new("sibling").run(move |_| {
                *flag.lock().unwrap() = true;
                Ok(())
            }),
        ];

        let (plan, tasks) = build_plan(&specs, &["transitive", "sibling"]);
        let report = run_plan(&plan, &tasks, &NoopReporter, Some(2)).unwrap();

        assert!(*sibling_ran.lock().unwrap());
        assert_eq!(report.completed, ["sibling"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");

        let mut skipped = report.skipped.clone();
        skipped.sort();
        assert_eq!(
            skipped,
            [
                ("dependent".to_string(), "broken".to_string()),
                ("transitive".to_string(), "broken".to_string()),
            ]
        );
    }

    #[test]
    fn actionless_tasks_are_ordering_nodes() {
        let specs = vec![
            TaskSpec::new("a"),
            TaskSpec::new("b").depends_on("a"),
        ];

        let (plan, tasks) = build_plan(&specs, &["b"]);
        let report = run_plan(&plan, &tasks, &NoopReporter, Some(1)).unwrap();

        assert!(report.success());
        assert_eq!(report.completed.len(), 2);
    }

    #[test]
    fn single_thread_pool_drains_the_whole_plan() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let record = |log: &Arc<Mutex<Vec<String>>>, name: &str| {
            let log = log.clone();
            let name = name.to_string();
            move |_: &TaskCx| {
                log.lock().unwrap().push(name.clone());
                Ok(())
            }
        };

        let specs = vec![
            TaskSpec::new("fetch").run(record(&log, "fetch")),
            TaskSpec::new("build").depends_on("fetch").run(record(&log, "build")),
            TaskSpec::new("verify").depends_on("build").run(record(&log, "verify")),
        ];

        let (plan, tasks) = build_plan(&specs, &["verify"]);
        let report = run_plan(&plan, &tasks, &NoopReporter, Some(1)).unwrap();

        assert!(report.success());
        assert_eq!(*log.lock().unwrap(), ["fetch", "build", "verify"]);
    }

    #[test]
    fn empty_plan_is_a_successful_noop() {
        let report = run_plan(
            &ExecutionPlan::default(),
            &HashMap::new(),
            &NoopReporter,
            None,
        )
        .unwrap();
        assert!(report.success());
        assert!(report.completed.is_empty());
    }
}
