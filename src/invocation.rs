//! The top-level entry point tying the pipeline together.
//!
//! An [`Invocation`] collects task and rule contributions, runs the
//! rule phases against a fresh model arena, resolves the dependency
//! graph for the requested goals, and walks the resulting plan. Arena,
//! pipeline and graph are all scoped to one invocation; nothing
//! carries over to the next.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::GantryError;
use crate::executor::{self, ExecutionReport};
use crate::graph::GraphBuilder;
use crate::model::ModelArena;
use crate::plan::ExecutionPlan;
use crate::reporter::{NoopReporter, Reporter};
use crate::rules::{Phase, Rule, RuleCx, RulePipeline, Selector};
use crate::task::TaskSpec;

/// A reusable bundle of contributions. Plugins only ever add tasks and
/// rules; they never observe or mutate each other.
pub trait Plugin {
    fn apply(&self, cx: &mut Contributions);
}

/// Collects what a plugin wants to add to the invocation.
#[derive(Default)]
pub struct Contributions {
    tasks: Vec<TaskSpec>,
    rules: Vec<Rule>,
}

impl Contributions {
    pub fn add_task(&mut self, task: TaskSpec) {
        self.tasks.push(task);
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }
}

/// One build invocation, from contribution to execution.
pub struct Invocation {
    tasks: Vec<TaskSpec>,
    pipeline: RulePipeline,
    goals: Vec<String>,
    reporter: Arc<dyn Reporter>,
    threads: Option<usize>,
    // Populated by `plan`, consumed by `execute`.
    arena: Option<ModelArena>,
    specs: HashMap<String, TaskSpec>,
}

impl Invocation {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            pipeline: RulePipeline::new(),
            goals: Vec::new(),
            reporter: Arc::new(NoopReporter),
            threads: None,
            arena: None,
            specs: HashMap::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Caps the worker pool; defaults to one thread per core.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Applies a plugin's contributions to this invocation.
    pub fn apply(&mut self, plugin: &dyn Plugin) -> &mut Self {
        let mut contributions = Contributions::default();
        plugin.apply(&mut contributions);

        self.tasks.extend(contributions.tasks);
        for rule in contributions.rules {
            self.pipeline.add(rule);
        }
        self
    }

    pub fn register_task(&mut self, task: TaskSpec) -> &mut Self {
        self.tasks.push(task);
        self
    }

    pub fn register_rule<F>(&mut self, phase: Phase, selector: Selector, action: F) -> &mut Self
    where
        F: Fn(&mut RuleCx, crate::model::ModelId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.pipeline.register(phase, selector, action);
        self
    }

    /// Requests a goal task; the plan covers its transitive closure.
    pub fn request(&mut self, goal: impl Into<String>) -> &mut Self {
        self.goals.push(goal.into());
        self
    }

    /// Settled model state, available after [`Invocation::plan`].
    pub fn model(&self) -> Option<&ModelArena> {
        self.arena.as_ref()
    }

    /// Runs the rule phases, merges derived contributions into the
    /// graph, and resolves an execution plan for the requested goals.
    pub fn plan(&mut self) -> Result<ExecutionPlan, GantryError> {
        let mut arena = ModelArena::new();
        let derived = self.pipeline.apply(&mut arena, self.reporter.as_ref())?;

        let mut builder = GraphBuilder::new();
        let mut specs = HashMap::new();

        for task in self.tasks.iter().cloned().chain(derived.tasks) {
            specs.insert(task.name.clone(), task.clone());
            builder.register(task)?;
        }
        for (task, depends_on) in &derived.dependencies {
            builder.add_dependency(task, depends_on)?;
        }
        for goal in &self.goals {
            builder.add_goal(goal.clone());
        }

        let plan = builder.build(self.reporter.as_ref())?;

        self.arena = Some(arena);
        self.specs = specs;
        Ok(plan)
    }

    /// Walks a plan produced by [`Invocation::plan`].
    pub fn execute(&self, plan: &ExecutionPlan) -> Result<ExecutionReport, GantryError> {
        executor::run_plan(plan, &self.specs, self.reporter.as_ref(), self.threads)
    }

    /// Plans and executes in one step.
    pub fn run(&mut self) -> Result<ExecutionReport, GantryError> {
        let plan = self.plan()?;
        self.execute(&plan)
    }
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::model::ModelKind;

    #[test]
    fn provenance_links_consumer_to_producer() {
        let mut invocation = Invocation::new();
        invocation
            .register_task(TaskSpec::new("compile").output("/bin/app"))
            .register_task(TaskSpec::new("test").input("/bin/app"))
            .request("test");

        let plan = invocation.plan().unwrap();
        let order: Vec<_> = plan.order().collect();
        assert_eq!(order, ["compile", "test"]);
        assert_eq!(plan.step("test").unwrap().depends_on, ["compile"]);
    }

    #[test]
    fn finalize_rules_derive_tasks_into_the_plan() {
        let mut invocation = Invocation::new();
        invocation.register_task(TaskSpec::new("assemble"));

        invocation.register_rule(Phase::Configure, Selector::root(), |cx, _| {
            cx.create(ModelKind::TestSuite, "unit");
            Ok(())
        });
        invocation.register_rule(
            Phase::Finalize,
            Selector::kind(ModelKind::TestSuite),
            |cx, id| {
                let name = format!("run-{}", cx.get(id)?.name);
                cx.add_task(TaskSpec::new(&name));
                cx.add_dependency(name, "assemble");
                Ok(())
            },
        );

        invocation.request("run-unit");
        let plan = invocation.plan().unwrap();
        assert_eq!(plan.order().collect::<Vec<_>>(), ["assemble", "run-unit"]);
    }

    #[test]
    fn plugins_contribute_tasks_and_rules() {
        struct Toolchain;

        impl Plugin for Toolchain {
            fn apply(&self, cx: &mut Contributions) {
                cx.add_task(TaskSpec::new("provision"));
                cx.add_rule(Rule::new(Phase::Configure, Selector::root(), |cx, root| {
                    cx.set(root, "toolchain", json!("gcc"))
                        .map_err(anyhow::Error::from)
                }));
            }
        }

        let mut invocation = Invocation::new();
        invocation.apply(&Toolchain).request("provision");

        let plan = invocation.plan().unwrap();
        assert_eq!(plan.order().collect::<Vec<_>>(), ["provision"]);

        let arena = invocation.model().unwrap();
        let root = arena.root();
        assert_eq!(arena.get(root).unwrap().attr("toolchain"), Some(&json!("gcc")));
    }

    #[test]
    fn run_executes_the_planned_tasks() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let seen = ran.clone();

        let mut invocation = Invocation::new();
        invocation
            .register_task(TaskSpec::new("compile").output("/bin/app").run({
                let ran = ran.clone();
                move |cx| {
                    ran.lock().unwrap().push(cx.name.to_string());
                    Ok(())
                }
            }))
            .register_task(TaskSpec::new("test").input("/bin/app").run({
                let ran = ran.clone();
                move |cx| {
                    ran.lock().unwrap().push(cx.name.to_string());
                    Ok(())
                }
            }))
            .request("test");

        let report = invocation.run().unwrap();
        assert!(report.success());
        assert_eq!(*seen.lock().unwrap(), ["compile", "test"]);
    }

    #[test]
    fn unknown_goal_is_reported() {
        let mut invocation = Invocation::new();
        invocation.request("deploy");
        assert!(invocation.plan().is_err());
    }
}
