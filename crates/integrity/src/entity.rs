//! Entity handles - in-memory, partially loaded domain objects
//!
//! An [`EntityRef`] is a shared handle to an [`Entity`]. Relations are kept
//! by name; a relation that was never fetched is [`RelationValue::NotLoaded`]
//! and must not be read as if it were empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Primary key value of a persisted entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Uuid(Uuid),
    Text(String),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(value) => write!(f, "{}", value),
            EntityId::Uuid(value) => write!(f, "{}", value),
            EntityId::Text(value) => write!(f, "{}", value),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Int(value)
    }
}

impl From<i32> for EntityId {
    fn from(value: i32) -> Self {
        EntityId::Int(i64::from(value))
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        EntityId::Uuid(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Text(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::Text(value)
    }
}

/// Current in-memory value of a relation property
#[derive(Debug, Clone, Default)]
pub enum RelationValue {
    /// Never fetched; only resolvable through the gateway
    #[default]
    NotLoaded,
    /// Loaded single-valued reference
    One(Option<EntityRef>),
    /// Loaded collection
    Many(Vec<EntityRef>),
}

impl RelationValue {
    pub fn is_loaded(&self) -> bool {
        !matches!(self, RelationValue::NotLoaded)
    }

    /// Loaded references held by this value, empty when not loaded
    pub fn references(&self) -> Vec<EntityRef> {
        match self {
            RelationValue::NotLoaded | RelationValue::One(None) => Vec::new(),
            RelationValue::One(Some(reference)) => vec![reference.clone()],
            RelationValue::Many(items) => items.clone(),
        }
    }
}

/// Per-entity record of references removed before the entity was handed out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityState {
    erased: BTreeMap<String, Vec<EntityId>>,
}

impl SecurityState {
    /// Record an erased id, ignoring duplicates
    pub fn record(&mut self, property: &str, id: EntityId) {
        let ids = self.erased.entry(property.to_string()).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    pub fn erased_ids(&self, property: &str) -> &[EntityId] {
        self.erased.get(property).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn erased(&self) -> &BTreeMap<String, Vec<EntityId>> {
        &self.erased
    }

    pub fn is_empty(&self) -> bool {
        self.erased.values().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        self.erased.clear();
    }
}

/// In-memory domain object
#[derive(Debug, Clone)]
pub struct Entity {
    type_name: String,
    id: Option<EntityId>,
    new: bool,
    removed: bool,
    deleted_at: Option<DateTime<Utc>>,
    relations: BTreeMap<String, RelationValue>,
    security: SecurityState,
}

impl Entity {
    /// Create a managed (previously persisted) entity
    pub fn new(type_name: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            type_name: type_name.into(),
            id: Some(id.into()),
            new: false,
            removed: false,
            deleted_at: None,
            relations: BTreeMap::new(),
            security: SecurityState::default(),
        }
    }

    /// Create an entity that has never been persisted
    pub fn transient(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: None,
            new: true,
            removed: false,
            deleted_at: None,
            relations: BTreeMap::new(),
            security: SecurityState::default(),
        }
    }

    /// Builder-style helper to set a single-valued relation
    pub fn with_one(mut self, property: &str, value: Option<EntityRef>) -> Self {
        self.set_one(property, value);
        self
    }

    /// Builder-style helper to set a collection relation
    pub fn with_many(mut self, property: &str, items: Vec<EntityRef>) -> Self {
        self.set_many(property, items);
        self
    }

    pub fn into_ref(self) -> EntityRef {
        EntityRef::new(self)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id(&self) -> Option<&EntityId> {
        self.id.as_ref()
    }

    pub fn set_id(&mut self, id: impl Into<EntityId>) {
        self.id = Some(id.into());
        self.new = false;
    }

    pub fn is_new(&self) -> bool {
        self.new
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn mark_removed(&mut self) {
        self.removed = true;
    }

    /// Undo `mark_removed` when the removal did not go through
    pub fn unmark_removed(&mut self) {
        self.removed = false;
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn mark_soft_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }

    pub fn relation(&self, property: &str) -> &RelationValue {
        static NOT_LOADED: RelationValue = RelationValue::NotLoaded;
        self.relations.get(property).unwrap_or(&NOT_LOADED)
    }

    pub fn relation_mut(&mut self, property: &str) -> &mut RelationValue {
        self.relations.entry(property.to_string()).or_default()
    }

    pub fn is_loaded(&self, property: &str) -> bool {
        self.relation(property).is_loaded()
    }

    pub fn set_one(&mut self, property: &str, value: Option<EntityRef>) {
        self.relations
            .insert(property.to_string(), RelationValue::One(value));
    }

    pub fn set_many(&mut self, property: &str, items: Vec<EntityRef>) {
        self.relations
            .insert(property.to_string(), RelationValue::Many(items));
    }

    /// Forget the in-memory value so the relation reads as not loaded
    pub fn unload(&mut self, property: &str) {
        self.relations.remove(property);
    }

    pub fn security(&self) -> &SecurityState {
        &self.security
    }

    pub fn security_mut(&mut self) -> &mut SecurityState {
        &mut self.security
    }
}

/// Shared handle to an in-memory entity
///
/// Two handles denote the same entity when they point at the same allocation
/// or, once persisted, carry the same type and primary key.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Shared access; a poisoned lock still yields the data
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access; a poisoned lock still yields the data
    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address of the shared allocation, stable while any handle is alive
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn same_entity(&self, other: &EntityRef) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let (left, right) = (self.key(), other.key());
        matches!((left, right), (Some(a), Some(b)) if a == b)
    }

    pub fn id(&self) -> Option<EntityId> {
        self.read().id().cloned()
    }

    pub fn type_name(&self) -> String {
        self.read().type_name().to_string()
    }

    /// `(type, id)` pair once persisted
    pub fn key(&self) -> Option<(String, EntityId)> {
        let entity = self.read();
        entity
            .id()
            .map(|id| (entity.type_name().to_string(), id.clone()))
    }

    pub fn is_loaded(&self, property: &str) -> bool {
        self.read().is_loaded(property)
    }

    /// Loaded references held by `property`
    pub fn references(&self, property: &str) -> Vec<EntityRef> {
        self.read().relation(property).references()
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entity = self.read();
        match entity.id() {
            Some(id) => write!(f, "{}#{}", entity.type_name(), id),
            None => write!(f, "{}#<new>", entity.type_name()),
        }
    }
}
