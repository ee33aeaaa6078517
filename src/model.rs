//! The lazily realized, plugin-configurable object model.
//!
//! Instead of an open-ended class hierarchy, the model is an arena of
//! [`ModelObject`]s addressed by stable [`ModelId`]s. Each object
//! carries a phase-state tag enforced by the rule pipeline: attributes
//! may be written while the object is `Configuring` or `Mutable`, and
//! never again once it is `Frozen`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;

/// The closed set of object kinds the core knows about. Plugins refine
/// behavior with matcher predicates, not new kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    /// The singleton root every arena starts with; creation rules use it
    /// as their subject.
    Root,
    Binary,
    Toolchain,
    TestSuite,
    Platform,
}

/// Phase-state tag of a model object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Configuring,
    Mutable,
    Frozen,
}

/// Stable index of an object within one invocation's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelId(pub(crate) usize);

/// A node in the configured object model. Attribute shapes are
/// plugin-defined, stored as JSON values.
#[derive(Debug, Clone)]
pub struct ModelObject {
    pub kind: ModelKind,
    pub name: String,
    state: ObjectState,
    attrs: serde_json::Map<String, Value>,
}

impl ModelObject {
    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.attrs.iter()
    }
}

/// Arena owning every realized model object of one build invocation.
///
/// Invocation-scoped state: created fresh per invocation and discarded
/// at its end, never shared across invocations.
#[derive(Debug)]
pub struct ModelArena {
    objects: Vec<ModelObject>,
    /// State assigned to newly created objects; follows the pipeline's
    /// current phase.
    current: ObjectState,
}

impl ModelArena {
    pub fn new() -> Self {
        Self {
            objects: vec![ModelObject {
                kind: ModelKind::Root,
                name: "model".to_string(),
                state: ObjectState::Configuring,
                attrs: serde_json::Map::new(),
            }],
            current: ObjectState::Configuring,
        }
    }

    /// The singleton root object.
    pub fn root(&self) -> ModelId {
        ModelId(0)
    }

    /// Realizes a new object of the given kind.
    pub fn create(&mut self, kind: ModelKind, name: impl Into<String>) -> ModelId {
        let name = name.into();
        tracing::debug!(?kind, name, "realized model object");

        self.objects.push(ModelObject {
            kind,
            name,
            state: self.current,
            attrs: serde_json::Map::new(),
        });

        ModelId(self.objects.len() - 1)
    }

    pub fn get(&self, id: ModelId) -> Result<&ModelObject, ModelError> {
        self.objects.get(id.0).ok_or(ModelError::UnknownObject(id))
    }

    /// Writes an attribute, failing with [`ModelError::Frozen`] once the
    /// object's finalize phase has completed.
    pub fn set_attr(
        &mut self,
        id: ModelId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), ModelError> {
        let object = self
            .objects
            .get_mut(id.0)
            .ok_or(ModelError::UnknownObject(id))?;

        if object.state == ObjectState::Frozen {
            return Err(ModelError::Frozen {
                object: object.name.clone(),
                attr: key.into(),
            });
        }

        object.attrs.insert(key.into(), value);
        Ok(())
    }

    /// Finds an object by kind and name.
    pub fn find(&self, kind: ModelKind, name: &str) -> Option<ModelId> {
        self.objects
            .iter()
            .position(|o| o.kind == kind && o.name == name)
            .map(ModelId)
    }

    /// All object ids, in realization order.
    pub fn ids(&self) -> impl Iterator<Item = ModelId> + use<> {
        (0..self.objects.len()).map(ModelId)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub(crate) fn set_phase_state(&mut self, state: ObjectState) {
        self.current = state;
        for object in &mut self.objects {
            if object.state != ObjectState::Frozen {
                object.state = state;
            }
        }
    }

    pub(crate) fn freeze_all(&mut self) {
        for object in &mut self.objects {
            object.state = ObjectState::Frozen;
        }
    }
}

impl Default for ModelArena {
    fn default() -> Self {
        Self::new()
    }
}
