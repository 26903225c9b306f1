//! Entity classification and admission-policy collaborator interfaces.

use crate::entity::{DeviceField, Entity, FieldSet};
use std::sync::Arc;

/// A classification bucket with its own definition of which entity fields
/// form a unique device key. Distinct classes get logically separate
/// secondary indices.
pub trait EntityClass: Send + Sync {
    /// Stable name of the class; used to key per-class index state.
    fn name(&self) -> &str;

    /// The fields that identify a device within this class.
    fn key_fields(&self) -> FieldSet;
}

/// Assigns an [`EntityClass`] to each observed entity.
pub trait EntityClassifier: Send + Sync {
    /// Classifies an entity, or returns `None` when it cannot be placed in
    /// any class (such an entity is not learnable).
    fn classify(&self, entity: &Entity) -> Option<Arc<dyn EntityClass>>;

    /// The key fields of the primary index.
    fn key_fields(&self) -> FieldSet;
}

/// Admission policy consulted before an entity is learned (e.g.,
/// anti-spoofing checks).
pub trait EntityPolicy: Send + Sync {
    fn is_entity_allowed(&self, entity: &Entity, class: &dyn EntityClass) -> bool;
}

/// Policy that admits every entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl EntityPolicy for AllowAll {
    fn is_entity_allowed(&self, _entity: &Entity, _class: &dyn EntityClass) -> bool {
        true
    }
}

/// The single class used by [`DefaultEntityClassifier`]: devices are
/// identified by (MAC, VLAN).
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEntityClass;

/// Key fields of the default class.
pub const DEFAULT_KEY_FIELDS: FieldSet = FieldSet::of(&[DeviceField::Mac, DeviceField::Vlan]);

impl EntityClass for DefaultEntityClass {
    fn name(&self) -> &str {
        "default"
    }

    fn key_fields(&self) -> FieldSet {
        DEFAULT_KEY_FIELDS
    }
}

/// Classifier that places every entity into [`DefaultEntityClass`].
pub struct DefaultEntityClassifier {
    class: Arc<DefaultEntityClass>,
}

impl DefaultEntityClassifier {
    pub fn new() -> Self {
        DefaultEntityClassifier {
            class: Arc::new(DefaultEntityClass),
        }
    }
}

impl Default for DefaultEntityClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityClassifier for DefaultEntityClassifier {
    fn classify(&self, _entity: &Entity) -> Option<Arc<dyn EntityClass>> {
        Some(self.class.clone())
    }

    fn key_fields(&self) -> FieldSet {
        DEFAULT_KEY_FIELDS
    }
}
