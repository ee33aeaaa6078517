//! Isolated worker process orchestration.
//!
//! A [`WorkerUnit`] describes one piece of work to execute outside the
//! orchestrating flow: serializable arguments plus a capability-sharing
//! allowlist. The [`Orchestrator`] spawns a named thread as the
//! isolated context, forwards the inputs, and collects a structured
//! result or failure. Only capabilities listed in the allowlist are
//! visible inside the context; everything else is denied, which keeps
//! the isolated work from accidentally coupling to the orchestrator.
//!
//! Failures are scoped to the unit: work that ran and reported an error
//! surfaces as [`WorkerFailure::Execution`] with any partial output it
//! produced, while a context that dies without a structured result
//! (panic, external kill) surfaces as [`WorkerFailure::Crash`] through
//! channel disconnection, so waiting never hangs. No variant is retried
//! here.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, bounded, select};
use serde_json::Value;

use crate::error::WorkerFailure;

/// Capability-sharing allowlist: the only configuration surface into
/// the orchestrator. Capabilities not listed are denied.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    entries: HashMap<String, bool>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), true);
        self
    }

    pub fn deny(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), false);
        self
    }

    pub fn allows(&self, name: &str) -> bool {
        self.entries.get(name).copied().unwrap_or(false)
    }
}

/// A request to execute isolated work. Created per work item, destroyed
/// when its result is collected or its failure is reported.
#[derive(Debug, Clone)]
pub struct WorkerUnit {
    pub name: String,
    pub args: Value,
    pub capabilities: Capabilities,
}

impl WorkerUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Value::Null,
            capabilities: Capabilities::new(),
        }
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Structured error reported by work that ran but failed.
#[derive(Debug)]
pub struct WorkError {
    pub message: String,
    /// Output produced before the failure, if any.
    pub partial: Option<Value>,
}

impl WorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: None,
        }
    }

    pub fn with_partial(mut self, partial: Value) -> Self {
        self.partial = Some(partial);
        self
    }
}

/// View of the isolated context handed to the work callback.
pub struct WorkerCx {
    name: String,
    args: Value,
    capabilities: Capabilities,
    cancelled: Arc<AtomicBool>,
}

impl WorkerCx {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    /// Whether the named capability was shared with this context.
    pub fn can(&self, capability: &str) -> bool {
        self.capabilities.allows(capability)
    }

    /// Cooperative cancellation check; long-running work should poll
    /// this and bail out when set.
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Handle to an in-flight worker context.
pub struct WorkerHandle {
    unit: String,
    cancelled: Arc<AtomicBool>,
    results: Receiver<Result<Value, WorkError>>,
    cancel: Receiver<()>,
    cancel_tx: crossbeam_channel::Sender<()>,
}

impl WorkerHandle {
    /// Requests cancellation. The context observes the flag
    /// cooperatively; any pending [`WorkerHandle::wait`] returns
    /// promptly instead of waiting the context out.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        let _ = self.cancel_tx.try_send(());
    }

    /// Blocks until the context produces a result, dies, or is
    /// cancelled. A context that terminates without a structured result
    /// drops its sender, so this never hangs.
    pub fn wait(self) -> Result<Value, WorkerFailure> {
        // A cancellation requested before the wait wins over any result
        // the context managed to squeeze out.
        if self.cancel.try_recv().is_ok() {
            return Err(WorkerFailure::Cancelled { unit: self.unit });
        }

        select! {
            recv(self.results) -> result => match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(error)) => Err(WorkerFailure::Execution {
                    unit: self.unit,
                    message: error.message,
                    partial: error.partial,
                }),
                Err(_) => Err(WorkerFailure::Crash { unit: self.unit }),
            },
            recv(self.cancel) -> _ => Err(WorkerFailure::Cancelled { unit: self.unit }),
        }
    }
}

/// Spawns isolated execution contexts and collects their results.
#[derive(Debug, Default)]
pub struct Orchestrator;

impl Orchestrator {
    pub fn new() -> Self {
        Self
    }

    /// Spawns the unit's isolated context and returns a handle to it.
    pub fn spawn<F>(&self, unit: WorkerUnit, work: F) -> Result<WorkerHandle, WorkerFailure>
    where
        F: FnOnce(&WorkerCx) -> Result<Value, WorkError> + Send + 'static,
    {
        let (results_tx, results) = bounded(1);
        let (cancel_tx, cancel) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        let cx = WorkerCx {
            name: unit.name.clone(),
            args: unit.args,
            capabilities: unit.capabilities,
            cancelled: cancelled.clone(),
        };

        tracing::debug!(unit = unit.name, "spawning worker context");

        thread::Builder::new()
            .name(format!("gantry-worker-{}", unit.name))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| work(&cx)));
                if let Ok(result) = outcome {
                    let _ = results_tx.send(result);
                }
                // A panic drops the sender without a message; the
                // receiver observes the disconnect as a crash.
            })
            .map_err(|source| WorkerFailure::Startup {
                unit: unit.name.clone(),
                source,
            })?;

        Ok(WorkerHandle {
            unit: unit.name,
            cancelled,
            results,
            cancel,
            cancel_tx,
        })
    }

    /// Spawns the unit and blocks until it resolves.
    pub fn execute<F>(&self, unit: WorkerUnit, work: F) -> Result<Value, WorkerFailure>
    where
        F: FnOnce(&WorkerCx) -> Result<Value, WorkError> + Send + 'static,
    {
        self.spawn(unit, work)?.wait()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn successful_work_returns_output() {
        let orchestrator = Orchestrator::new();
        let unit = WorkerUnit::new("ok").args(json!({ "n": 2 }));

        let output = orchestrator
            .execute(unit, |cx| {
                let n = cx.args()["n"].as_i64().unwrap();
                Ok(json!(n * 2))
            })
            .unwrap();

        assert_eq!(output, json!(4));
    }

    #[test]
    fn unlisted_capabilities_are_denied() {
        let orchestrator = Orchestrator::new();
        let unit = WorkerUnit::new("caps")
            .capabilities(Capabilities::new().allow("fs.read").deny("net"));

        let output = orchestrator
            .execute(unit, |cx| {
                Ok(json!([cx.can("fs.read"), cx.can("net"), cx.can("gpu")]))
            })
            .unwrap();

        assert_eq!(output, json!([true, false, false]));
    }

    #[test]
    fn reported_error_keeps_partial_output() {
        let orchestrator = Orchestrator::new();

        let err = orchestrator
            .execute(WorkerUnit::new("partial"), |_| {
                Err(WorkError::new("2 of 5 cases failed").with_partial(json!({ "passed": 3 })))
            })
            .unwrap_err();

        match err {
            WorkerFailure::Execution { unit, message, partial } => {
                assert_eq!(unit, "partial");
                assert_eq!(message, "2 of 5 cases failed");
                assert_eq!(partial, Some(json!({ "passed": 3 })));
            }
            other => panic!("expected Execution, got {other:?}"),
        }
    }

    #[test]
    fn dead_context_resolves_as_crash_instead_of_hanging() {
        let orchestrator = Orchestrator::new();

        let err = orchestrator
            .execute(WorkerUnit::new("boom"), |_| -> Result<Value, WorkError> {
                panic!("killed");
            })
            .unwrap_err();

        assert!(matches!(err, WorkerFailure::Crash { unit } if unit == "boom"));
    }

    #[test]
    fn cancellation_returns_promptly() {
        let orchestrator = Orchestrator::new();

        let handle = orchestrator
            .spawn(WorkerUnit::new("slow"), |cx| {
                while !cx.cancelled() {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(WorkError::new("cancelled"))
            })
            .unwrap();

        handle.cancel();
        let err = handle.wait().unwrap_err();
        assert!(matches!(err, WorkerFailure::Cancelled { unit } if unit == "slow"));
    }
}
