//! The staged model rule pipeline.
//!
//! Plugins contribute [`Rule`]s tagged with a [`Phase`] and a
//! [`Selector`]. The pipeline applies all Configure rules, then all
//! Mutate rules, then all Finalize rules, each phase running to a
//! fixpoint: a rule fires exactly once per matching object, including
//! objects created *during* the phase by earlier rules. A phase only
//! closes when no newly created object has unapplied matching rules.
//!
//! Separating the phases lets independent plugins contribute
//! incrementally without coordinating order among themselves: Configure
//! creates defaults, Mutate adjusts other plugins' defaults, Finalize
//! derives tasks from settled state. Once Finalize closes, every object
//! is frozen for the remainder of the build.

use std::collections::HashSet;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use crate::error::ModelError;
use crate::model::{ModelArena, ModelId, ModelKind, ModelObject, ObjectState};
use crate::reporter::{BuildEvent, Reporter};
use crate::task::TaskSpec;

/// Rule phases, a strict total order. Transition is forward-only within
/// one build invocation; there is no phase re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Configure,
    Mutate,
    Finalize,
}

impl Phase {
    pub(crate) const ALL: [Phase; 3] = [Phase::Configure, Phase::Mutate, Phase::Finalize];
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Configure => write!(f, "configure"),
            Phase::Mutate => write!(f, "mutate"),
            Phase::Finalize => write!(f, "finalize"),
        }
    }
}

type Predicate = Arc<dyn Fn(&ModelObject) -> bool + Send + Sync>;

/// Identifies which model objects a rule applies to: an optional kind
/// filter plus an optional matcher predicate.
#[derive(Clone, Default)]
pub struct Selector {
    kind: Option<ModelKind>,
    predicate: Option<Predicate>,
}

impl Selector {
    /// Matches every object of the given kind.
    pub fn kind(kind: ModelKind) -> Self {
        Self {
            kind: Some(kind),
            predicate: None,
        }
    }

    /// Matches the arena root; the subject used by rules that create
    /// objects rather than refine existing ones.
    pub fn root() -> Self {
        Self::kind(ModelKind::Root)
    }

    /// Restricts the selector with a matcher predicate.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ModelObject) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    fn matches(&self, object: &ModelObject) -> bool {
        if let Some(kind) = self.kind
            && object.kind != kind
        {
            return false;
        }

        match &self.predicate {
            Some(predicate) => predicate(object),
            None => true,
        }
    }
}

impl Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("kind", &self.kind)
            .field("predicate", &self.predicate.as_ref().map(|_| "*"))
            .finish()
    }
}

type RuleAction = Arc<dyn Fn(&mut RuleCx, ModelId) -> anyhow::Result<()> + Send + Sync>;

/// A phase-tagged, selector-scoped mutation contributed by a plugin.
/// Rules are never removed during a build.
#[derive(Clone)]
pub struct Rule {
    pub phase: Phase,
    pub selector: Selector,
    action: RuleAction,
}

impl Rule {
    pub fn new<F>(phase: Phase, selector: Selector, action: F) -> Self
    where
        F: Fn(&mut RuleCx, ModelId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            phase,
            selector,
            action: Arc::new(action),
        }
    }
}

impl Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("phase", &self.phase)
            .field("selector", &self.selector)
            .finish()
    }
}

/// Task contributions collected from rule actions, merged into the
/// graph builder only after the whole pipeline has completed. The
/// global acyclicity check runs on the merged result, never interleaved
/// with phase application.
#[derive(Debug, Default)]
pub struct Derived {
    pub tasks: Vec<TaskSpec>,
    /// Retroactive edges: `(task, depends_on)` pairs.
    pub dependencies: Vec<(String, String)>,
}

/// Context handed to a rule action: the arena plus the contribution
/// buffers for derived tasks and retroactive dependencies.
pub struct RuleCx<'a> {
    arena: &'a mut ModelArena,
    derived: &'a mut Derived,
}

impl RuleCx<'_> {
    /// Realizes a new model object.
    pub fn create(&mut self, kind: ModelKind, name: impl Into<String>) -> ModelId {
        self.arena.create(kind, name)
    }

    pub fn get(&self, id: ModelId) -> Result<&ModelObject, ModelError> {
        self.arena.get(id)
    }

    /// Writes an attribute; fails once the target object is frozen.
    pub fn set(
        &mut self,
        id: ModelId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), ModelError> {
        self.arena.set_attr(id, key, value)
    }

    pub fn find(&self, kind: ModelKind, name: &str) -> Option<ModelId> {
        self.arena.find(kind, name)
    }

    pub fn objects(&self) -> impl Iterator<Item = ModelId> + use<> {
        self.arena.ids()
    }

    /// Contributes a task derived from settled model state.
    pub fn add_task(&mut self, task: TaskSpec) {
        self.derived.tasks.push(task);
    }

    /// Contributes a dependency edge retroactively, even onto tasks
    /// whose own resolution already completed.
    pub fn add_dependency(&mut self, task: impl Into<String>, depends_on: impl Into<String>) {
        self.derived
            .dependencies
            .push((task.into(), depends_on.into()));
    }
}

/// Registry of phase-tagged rules; applies them in phase order against
/// the model arena. Invocation-scoped, discarded at invocation end.
#[derive(Debug, Default)]
pub struct RulePipeline {
    rules: Vec<Rule>,
}

impl RulePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a rule contribution. All contributions are collected
    /// before [`RulePipeline::apply`] starts.
    pub fn register<F>(&mut self, phase: Phase, selector: Selector, action: F)
    where
        F: Fn(&mut RuleCx, ModelId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.rules.push(Rule::new(phase, selector, action));
    }

    pub fn add(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs all phases to completion against `arena`, returning the
    /// task contributions collected along the way.
    pub fn apply(
        &self,
        arena: &mut ModelArena,
        reporter: &dyn Reporter,
    ) -> Result<Derived, ModelError> {
        let mut derived = Derived::default();

        for phase in Phase::ALL {
            reporter.event(BuildEvent::PhaseStarted { phase });
            tracing::debug!(%phase, "rule phase started");

            arena.set_phase_state(match phase {
                Phase::Configure => ObjectState::Configuring,
                Phase::Mutate | Phase::Finalize => ObjectState::Mutable,
            });

            let fired = self.run_phase(phase, arena, &mut derived)?;

            if phase == Phase::Finalize {
                arena.freeze_all();
            }

            reporter.event(BuildEvent::PhaseCompleted {
                phase,
                rules_fired: fired,
            });
            tracing::debug!(%phase, fired, "rule phase completed");
        }

        Ok(derived)
    }

    /// Fixpoint over (rule, object) pairs for one phase. Rules run in
    /// registration order, objects in realization order; every firing
    /// restarts the scan so that freshly created objects are seen.
    fn run_phase(
        &self,
        phase: Phase,
        arena: &mut ModelArena,
        derived: &mut Derived,
    ) -> Result<usize, ModelError> {
        let mut applied: HashSet<(usize, ModelId)> = HashSet::new();

        'fixpoint: loop {
            for (index, rule) in self.rules.iter().enumerate() {
                if rule.phase != phase {
                    continue;
                }

                for id in arena.ids() {
                    if applied.contains(&(index, id)) {
                        continue;
                    }

                    let object = arena.get(id)?;
                    if !rule.selector.matches(object) {
                        continue;
                    }

                    let name = object.name.clone();
                    applied.insert((index, id));

                    let mut cx = RuleCx {
                        arena: &mut *arena,
                        derived: &mut *derived,
                    };
                    (rule.action)(&mut cx, id).map_err(|source| ModelError::Rule {
                        phase,
                        object: name,
                        source,
                    })?;

                    continue 'fixpoint;
                }
            }

            break;
        }

        Ok(applied.len())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::reporter::NoopReporter;

    #[test]
    fn phases_run_in_order_and_settle_attributes() {
        let mut pipeline = RulePipeline::new();

        // Configure: create O. Mutate: set a=1. Finalize: read a.
        pipeline.register(Phase::Configure, Selector::root(), |cx, _| {
            cx.create(ModelKind::Binary, "o");
            Ok(())
        });
        pipeline.register(Phase::Mutate, Selector::kind(ModelKind::Binary), |cx, id| {
            cx.set(id, "a", json!(1))?;
            Ok(())
        });
        pipeline.register(
            Phase::Finalize,
            Selector::kind(ModelKind::Binary),
            |cx, id| {
                assert_eq!(cx.get(id)?.attr("a"), Some(&json!(1)));
                Ok(())
            },
        );

        let mut arena = ModelArena::new();
        pipeline.apply(&mut arena, &NoopReporter).unwrap();

        let id = arena.find(ModelKind::Binary, "o").unwrap();
        assert_eq!(arena.get(id).unwrap().attr("a"), Some(&json!(1)));
    }

    #[test]
    fn mutation_after_finalize_is_rejected() {
        let mut pipeline = RulePipeline::new();
        pipeline.register(Phase::Configure, Selector::root(), |cx, _| {
            cx.create(ModelKind::Binary, "o");
            Ok(())
        });

        let mut arena = ModelArena::new();
        pipeline.apply(&mut arena, &NoopReporter).unwrap();

        let id = arena.find(ModelKind::Binary, "o").unwrap();
        let err = arena.set_attr(id, "a", json!(2)).unwrap_err();
        assert!(matches!(err, ModelError::Frozen { .. }));
    }

    #[test]
    fn objects_created_mid_phase_still_receive_matching_rules() {
        let mut pipeline = RulePipeline::new();

        // A mutate rule matching test suites, registered before the rule
        // that creates one mid-phase.
        pipeline.register(
            Phase::Mutate,
            Selector::kind(ModelKind::TestSuite),
            |cx, id| {
                cx.set(id, "visited", json!(true))?;
                Ok(())
            },
        );
        pipeline.register(Phase::Mutate, Selector::root(), |cx, _| {
            cx.create(ModelKind::TestSuite, "p");
            Ok(())
        });

        let mut arena = ModelArena::new();
        pipeline.apply(&mut arena, &NoopReporter).unwrap();

        let id = arena.find(ModelKind::TestSuite, "p").unwrap();
        assert_eq!(arena.get(id).unwrap().attr("visited"), Some(&json!(true)));
    }

    #[test]
    fn selector_predicate_narrows_matches() {
        let mut pipeline = RulePipeline::new();
        pipeline.register(Phase::Configure, Selector::root(), |cx, _| {
            cx.create(ModelKind::Binary, "app");
            cx.create(ModelKind::Binary, "helper");
            Ok(())
        });
        pipeline.register(
            Phase::Mutate,
            Selector::kind(ModelKind::Binary).filter(|o| o.name == "app"),
            |cx, id| {
                cx.set(id, "main", json!(true))?;
                Ok(())
            },
        );

        let mut arena = ModelArena::new();
        pipeline.apply(&mut arena, &NoopReporter).unwrap();

        let app = arena.find(ModelKind::Binary, "app").unwrap();
        let helper = arena.find(ModelKind::Binary, "helper").unwrap();
        assert_eq!(arena.get(app).unwrap().attr("main"), Some(&json!(true)));
        assert_eq!(arena.get(helper).unwrap().attr("main"), None);
    }

    #[test]
    fn finalize_rules_derive_tasks_from_settled_state() {
        let mut pipeline = RulePipeline::new();
        pipeline.register(Phase::Configure, Selector::root(), |cx, _| {
            cx.create(ModelKind::TestSuite, "unit");
            Ok(())
        });
        pipeline.register(
            Phase::Finalize,
            Selector::kind(ModelKind::TestSuite),
            |cx, id| {
                let name = format!("run-{}", cx.get(id)?.name);
                cx.add_task(TaskSpec::new(name));
                cx.add_dependency("run-unit", "compile");
                Ok(())
            },
        );

        let mut arena = ModelArena::new();
        let derived = pipeline.apply(&mut arena, &NoopReporter).unwrap();

        assert_eq!(derived.tasks.len(), 1);
        assert_eq!(derived.tasks[0].name, "run-unit");
        assert_eq!(
            derived.dependencies,
            vec![("run-unit".to_string(), "compile".to_string())]
        );
    }

    #[test]
    fn failing_rule_aborts_the_pipeline() {
        let mut pipeline = RulePipeline::new();
        pipeline.register(Phase::Configure, Selector::root(), |_, _| {
            anyhow::bail!("bad contribution")
        });

        let mut arena = ModelArena::new();
        let err = pipeline.apply(&mut arena, &NoopReporter).unwrap_err();
        assert!(matches!(err, ModelError::Rule { phase: Phase::Configure, .. }));
    }
}
