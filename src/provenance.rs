//! Mapping from output file paths to the tasks that produce them.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::GraphError;

/// Index of file provenance, built incrementally as tasks are
/// registered. Within one build invocation a given path maps to at most
/// one producer; a second producer is a configuration error, never a
/// silent overwrite.
///
/// The index is fully populated before any file-based dependency
/// descriptor is walked, so resolution order does not depend on
/// registration order.
#[derive(Debug, Default)]
pub struct ProvenanceIndex {
    producers: HashMap<Utf8PathBuf, String>,
}

impl ProvenanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `task` as the producer of `path`.
    ///
    /// Re-registering the same producer is a no-op; a different producer
    /// fails with [`GraphError::DuplicateProducer`].
    pub fn register(
        &mut self,
        path: impl Into<Utf8PathBuf>,
        task: &str,
    ) -> Result<(), GraphError> {
        let path = path.into();

        match self.producers.get(&path) {
            Some(existing) if existing != task => Err(GraphError::DuplicateProducer {
                path,
                existing: existing.clone(),
                duplicate: task.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                tracing::debug!(path = %path, task, "registered output producer");
                self.producers.insert(path, task.to_string());
                Ok(())
            }
        }
    }

    /// Looks up the task producing `path`. Paths with no known producer
    /// are externally supplied sources, not errors.
    pub fn lookup(&self, path: impl AsRef<Utf8Path>) -> Option<&str> {
        self.producers.get(path.as_ref()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}
