#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod executor;
mod graph;
mod invocation;
mod model;
mod plan;
mod provenance;
mod reporter;
mod rules;
mod task;
mod utils;
mod worker;

pub use crate::error::{ActionResult, GantryError, GraphError, ModelError, WorkerFailure};
pub use crate::executor::{ExecutionReport, TaskExecution};
pub use crate::graph::GraphBuilder;
pub use crate::invocation::{Contributions, Invocation, Plugin};
pub use crate::model::{ModelArena, ModelId, ModelKind, ModelObject, ObjectState};
pub use crate::plan::{ExecutionPlan, PlanStep};
pub use crate::provenance::ProvenanceIndex;
pub use crate::reporter::{BuildEvent, ConsoleReporter, LogReporter, NoopReporter, Reporter};
pub use crate::rules::{Derived, Phase, Rule, RuleCx, RulePipeline, Selector};
pub use crate::task::{Dependency, DependencyProvider, TaskAction, TaskCx, TaskSpec};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::worker::{Capabilities, Orchestrator, WorkError, WorkerCx, WorkerHandle, WorkerUnit};
