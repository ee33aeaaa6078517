//! The topologically ordered output of graph resolution.

use serde::{Deserialize, Serialize};

/// One entry of an [`ExecutionPlan`]: a task plus its resolved direct
/// dependencies, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub task: String,
    pub depends_on: Vec<String>,
}

/// Ordered sequence of tasks, ready for scheduling. Every task appears
/// after all of its transitively resolved dependencies; tasks with no
/// ordering constraint between them keep discovery order, so identical
/// input graphs always yield identical plans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Positions of the tasks in execution order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.task.as_str())
    }

    pub fn step(&self, task: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.task == task)
    }
}

impl std::fmt::Display for ExecutionPlan {
    /// Renders the plan as a mermaid flowchart.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, step) in self.steps.iter().enumerate() {
            let name = step.task.replace('"', "\\\""); // Simple escape
            writeln!(f, "    {index}[\"{name}\"]")?;
        }

        for (index, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                if let Some(source) = self.steps.iter().position(|s| &s.task == dep) {
                    writeln!(f, "    {source} --> {index}")?;
                }
            }
        }

        Ok(())
    }
}
