//! Task dependency graph resolution.
//!
//! The [`GraphBuilder`] owns the set of registered [`TaskSpec`]s and the
//! [`ProvenanceIndex`], expands every task's declared and implicit
//! dependencies into concrete edges, detects cycles, and produces a
//! topologically ordered [`ExecutionPlan`].
//!
//! Resolution walks each task's descriptors depth-first with an explicit
//! stack; a node encountered while already on the stack is a cycle, and
//! the error names the cycle members in discovery order. Resolved
//! dependency sets are memoized, so re-resolving a task within one
//! invocation is idempotent. After resolution, acyclicity is asserted
//! once more globally over the assembled graph, which catches edges
//! contributed retroactively by finalize-phase rules.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::Graph;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::NodeIndex;

use crate::error::GraphError;
use crate::plan::{ExecutionPlan, PlanStep};
use crate::provenance::ProvenanceIndex;
use crate::reporter::{BuildEvent, Reporter};
use crate::task::{Dependency, TaskSpec};

/// Builds the execution graph for one build invocation.
///
/// Lifecycle: tasks and goals are registered, [`GraphBuilder::build`]
/// resolves the goal closure into a plan, and the builder is discarded
/// at invocation end. A failed build never partially mutates a
/// previously returned plan.
#[derive(Default)]
pub struct GraphBuilder {
    tasks: Vec<TaskSpec>,
    index: HashMap<String, usize>,
    goals: Vec<String>,
    provenance: ProvenanceIndex,
    /// Memoized direct dependency sets, deduplicated, discovery order.
    resolved: HashMap<usize, Vec<usize>>,
    /// Tasks in the order they were first discovered; the tie-break for
    /// nodes with no ordering constraint between them.
    discovery: Vec<usize>,
    discovered: HashSet<usize>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. Duplicate names and duplicate output producers
    /// are rejected eagerly, at registration time.
    pub fn register(&mut self, task: TaskSpec) -> Result<(), GraphError> {
        if self.index.contains_key(&task.name) {
            return Err(GraphError::DuplicateTask(task.name));
        }

        for output in &task.outputs {
            self.provenance.register(output.clone(), &task.name)?;
        }

        tracing::debug!(task = task.name, "registered task");
        self.index.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    /// Seeds the goal closure with a requested task.
    pub fn add_goal(&mut self, name: impl Into<String>) {
        self.goals.push(name.into());
    }

    /// Appends a dependency edge contributed after registration, e.g.
    /// by a finalize-phase rule. Drops the task's memoized resolution,
    /// if any, so the new edge is seen by the next resolution.
    pub fn add_dependency(&mut self, task: &str, depends_on: &str) -> Result<(), GraphError> {
        let slot = *self.index.get(task).ok_or_else(|| GraphError::UnresolvableReference {
            referrer: "a rule contribution".to_string(),
            reference: task.to_string(),
        })?;

        self.tasks[slot]
            .dependencies
            .push(Dependency::Task(depends_on.to_string()));
        self.resolved.remove(&slot);
        Ok(())
    }

    pub fn provenance(&self) -> &ProvenanceIndex {
        &self.provenance
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Resolves a task's direct dependencies to task names. The result
    /// is cached after the first resolution; later calls return the
    /// same set.
    pub fn resolve(
        &mut self,
        name: &str,
        reporter: &dyn Reporter,
    ) -> Result<Vec<String>, GraphError> {
        let slot = *self
            .index
            .get(name)
            .ok_or_else(|| GraphError::unresolvable_goal(name))?;

        let mut stack = Vec::new();
        self.resolve_slot(slot, &mut stack, reporter)?;

        Ok(self.resolved[&slot]
            .iter()
            .map(|&dep| self.tasks[dep].name.clone())
            .collect())
    }

    /// Resolves every task reachable from the requested goals, asserts
    /// acyclicity globally, and returns the ordered plan.
    pub fn build(&mut self, reporter: &dyn Reporter) -> Result<ExecutionPlan, GraphError> {
        let goal_slots = self
            .goals
            .clone()
            .into_iter()
            .map(|goal| {
                self.index
                    .get(&goal)
                    .copied()
                    .ok_or_else(|| GraphError::unresolvable_goal(goal))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Walk the goal closure, resolving as we go. A memoized entry
        // short-circuits resolve_slot without recursing, so tasks only
        // reachable through cached sets still need a resolve here; this
        // also re-expands any entry invalidated by a retroactive edge.
        let mut stack = Vec::new();
        let mut closure = HashSet::new();
        let mut worklist = goal_slots.clone();

        while let Some(slot) = worklist.pop() {
            if closure.insert(slot) {
                self.resolve_slot(slot, &mut stack, reporter)?;
                worklist.extend(self.resolved[&slot].iter().copied());
            }
        }

        self.check_acyclic(&closure)?;
        Ok(self.order(&closure))
    }

    /// Expands one task's descriptors and recursively resolves the
    /// discovered dependencies, maintaining the resolution stack for
    /// cycle detection.
    fn resolve_slot(
        &mut self,
        slot: usize,
        stack: &mut Vec<usize>,
        reporter: &dyn Reporter,
    ) -> Result<(), GraphError> {
        if self.resolved.contains_key(&slot) {
            return Ok(());
        }

        if let Some(position) = stack.iter().position(|&s| s == slot) {
            let members = stack[position..]
                .iter()
                .map(|&s| self.tasks[s].name.clone())
                .collect();
            return Err(GraphError::Cycle(members));
        }

        if self.discovered.insert(slot) {
            self.discovery.push(slot);
        }

        let name = self.tasks[slot].name.clone();
        reporter.event(BuildEvent::ResolveStarted { task: name.clone() });

        stack.push(slot);

        let descriptors = self.tasks[slot].dependencies.clone();
        let mut deps: Vec<usize> = Vec::new();
        let mut add = |dep: usize| {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        };

        for descriptor in descriptors {
            match descriptor {
                Dependency::Task(reference) => {
                    let dep = *self
                        .index
                        .get(&reference)
                        .ok_or_else(|| GraphError::unresolvable_task(&name, reference))?;
                    add(dep);
                }
                Dependency::TaskInputs => {
                    for path in self.tasks[slot].inputs.clone() {
                        // A task consuming its own output does not
                        // depend on itself; a missing producer means an
                        // externally supplied source.
                        match self.provenance.lookup(&path) {
                            Some(producer) if self.index[producer] != slot => {
                                add(self.index[producer]);
                            }
                            _ => {}
                        }
                    }
                }
                Dependency::Files(paths) => {
                    for path in paths {
                        match self.provenance.lookup(&path) {
                            Some(producer) if self.index[producer] != slot => {
                                add(self.index[producer]);
                            }
                            _ => {}
                        }
                    }
                }
                Dependency::Provided(provider) => {
                    for reference in provider.contribute() {
                        let dep = *self
                            .index
                            .get(&reference)
                            .ok_or_else(|| GraphError::unresolvable_task(&name, reference))?;
                        add(dep);
                    }
                }
            }
        }

        for &dep in &deps {
            self.resolve_slot(dep, stack, reporter)?;
        }

        stack.pop();

        reporter.event(BuildEvent::ResolveCompleted {
            task: name.clone(),
            dependencies: deps.len(),
        });
        tracing::debug!(task = name, dependencies = deps.len(), "resolved task");

        self.resolved.insert(slot, deps);
        Ok(())
    }

    /// Global acyclicity gate over the assembled graph; the per-task
    /// stack check already covers resolution-time cycles, this catches
    /// edges merged in after individual resolutions completed.
    fn check_acyclic(&self, closure: &HashSet<usize>) -> Result<(), GraphError> {
        let mut graph = Graph::<usize, ()>::new();
        let mut nodes: HashMap<usize, NodeIndex> = HashMap::new();

        for &slot in &self.discovery {
            if closure.contains(&slot) {
                nodes.insert(slot, graph.add_node(slot));
            }
        }

        for (&slot, deps) in &self.resolved {
            if !closure.contains(&slot) {
                continue;
            }
            for &dep in deps {
                graph.add_edge(nodes[&dep], nodes[&slot], ());
            }
        }

        if toposort(&graph, None).is_ok() {
            return Ok(());
        }

        // A cycle is a component of two or more nodes, or a single node
        // carrying a self-edge.
        let members = tarjan_scc(&graph)
            .into_iter()
            .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .unwrap_or_default()
            .into_iter()
            .map(|node| self.tasks[graph[node]].name.clone())
            .collect();
        Err(GraphError::Cycle(members))
    }

    /// Kahn's algorithm with the discovery-order tie-break; identical
    /// input graphs always yield identical plans.
    fn order(&self, closure: &HashSet<usize>) -> ExecutionPlan {
        let rank: HashMap<usize, usize> = self
            .discovery
            .iter()
            .enumerate()
            .map(|(rank, &slot)| (slot, rank))
            .collect();

        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut indegree: HashMap<usize, usize> = HashMap::new();

        for &slot in closure {
            let deps = &self.resolved[&slot];
            indegree.insert(slot, deps.len());
            for &dep in deps {
                dependents.entry(dep).or_default().push(slot);
            }
        }

        let mut ready: BTreeSet<(usize, usize)> = indegree
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&slot, _)| (rank[&slot], slot))
            .collect();

        let mut steps = Vec::with_capacity(closure.len());

        while let Some(&(r, slot)) = ready.iter().next() {
            ready.remove(&(r, slot));

            steps.push(PlanStep {
                task: self.tasks[slot].name.clone(),
                depends_on: self.resolved[&slot]
                    .iter()
                    .map(|&dep| self.tasks[dep].name.clone())
                    .collect(),
            });

            for &dependent in dependents.get(&slot).into_iter().flatten() {
                let count = indegree.get_mut(&dependent).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.insert((rank[&dependent], dependent));
                }
            }
        }

        ExecutionPlan { steps }
    }
}
