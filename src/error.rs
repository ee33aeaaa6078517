use camino::Utf8PathBuf;
use thiserror::Error;

use crate::model::ModelId;
use crate::rules::Phase;

/// Result type for userland task and rule actions.
pub type ActionResult<T> = anyhow::Result<T>;

/// Errors raised while registering tasks or resolving the task graph.
///
/// All of these abort the current build invocation; a plan built on an
/// inconsistent graph would produce silently wrong ordering.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Output '{path}' is already produced by task '{existing}'; task '{duplicate}' cannot claim it")]
    DuplicateProducer {
        path: Utf8PathBuf,
        existing: String,
        duplicate: String,
    },

    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Task '{reference}' referenced by {referrer} is not registered")]
    UnresolvableReference { referrer: String, reference: String },
}

impl GraphError {
    pub(crate) fn unresolvable_task(referrer: &str, reference: impl Into<String>) -> Self {
        GraphError::UnresolvableReference {
            referrer: format!("task '{referrer}'"),
            reference: reference.into(),
        }
    }

    pub(crate) fn unresolvable_goal(reference: impl Into<String>) -> Self {
        GraphError::UnresolvableReference {
            referrer: "the requested goals".to_string(),
            reference: reference.into(),
        }
    }
}

/// Errors raised by the staged model rule pipeline.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model object '{object}' is frozen; attribute '{attr}' can no longer be modified")]
    Frozen { object: String, attr: String },

    #[error("Model object {0:?} does not exist")]
    UnknownObject(ModelId),

    #[error("Rule failed in {phase} phase on '{object}':\n{source}")]
    Rule {
        phase: Phase,
        object: String,
        source: anyhow::Error,
    },
}

/// Failure of a single isolated worker unit.
///
/// None of these variants are retried here; whether to re-attempt a
/// failed unit is the caller's policy. A worker failure is scoped to the
/// owning task, it never aborts sibling branches of the plan.
#[derive(Debug, Error)]
pub enum WorkerFailure {
    #[error("Worker '{unit}' could not be started:\n{source}")]
    Startup {
        unit: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker '{unit}' reported a failure: {message}")]
    Execution {
        unit: String,
        message: String,
        /// Partial output the unit managed to produce before failing.
        partial: Option<serde_json::Value>,
    },

    #[error("Worker '{unit}' terminated without producing a result")]
    Crash { unit: String },

    #[error("Worker '{unit}' was cancelled")]
    Cancelled { unit: String },
}

/// Umbrella error for a build invocation.
#[derive(Debug, Error)]
pub enum GantryError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Worker(#[from] WorkerFailure),

    #[error("Failed to build the worker thread pool:\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
