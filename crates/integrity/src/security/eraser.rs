use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::delete_policy::VisitedSet;
use crate::entity::{EntityId, EntityRef, RelationValue};
use crate::error::{IntegrityError, IntegrityResult};
use crate::gateway::PersistenceGateway;
use crate::metadata::MetaModel;

/// One reference that failed the read predicate
#[derive(Debug, Clone)]
pub struct ErasedReference {
    pub owner: EntityRef,
    pub property: String,
    pub id: EntityId,
}

impl PartialEq for ErasedReference {
    fn eq(&self, other: &Self) -> bool {
        self.owner.same_entity(&other.owner) && self.property == other.property && self.id == other.id
    }
}

impl Eq for ErasedReference {}

type ReferenceKey<O> = (O, String, EntityId);

/// Deduplicated, insertion-ordered set of erased references
///
/// Deduplication is indexed the same way as [`VisitedSet`]: by owner
/// allocation, and by owner type and id once persisted.
#[derive(Debug, Clone, Default)]
pub struct ErasedReferenceSet {
    references: Vec<ErasedReference>,
    by_address: HashSet<ReferenceKey<usize>>,
    by_key: HashSet<ReferenceKey<(String, EntityId)>>,
}

impl PartialEq for ErasedReferenceSet {
    fn eq(&self, other: &Self) -> bool {
        self.references == other.references
    }
}

impl Eq for ErasedReferenceSet {}

impl ErasedReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference; returns false if it was already present
    pub fn insert(&mut self, reference: ErasedReference) -> bool {
        let by_address = (
            reference.owner.address(),
            reference.property.clone(),
            reference.id.clone(),
        );
        let by_key = reference
            .owner
            .key()
            .map(|key| (key, reference.property.clone(), reference.id.clone()));

        if self.by_address.contains(&by_address)
            || by_key.as_ref().map_or(false, |key| self.by_key.contains(key))
        {
            return false;
        }
        self.by_address.insert(by_address);
        if let Some(key) = by_key {
            self.by_key.insert(key);
        }
        self.references.push(reference);
        true
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErasedReference> {
        self.references.iter()
    }

    /// References recorded against `owner`
    pub fn for_owner<'a>(&'a self, owner: &'a EntityRef) -> impl Iterator<Item = &'a ErasedReference> + 'a {
        self.references
            .iter()
            .filter(move |reference| reference.owner.same_entity(owner))
    }
}

impl<'a> IntoIterator for &'a ErasedReferenceSet {
    type Item = &'a ErasedReference;
    type IntoIter = std::slice::Iter<'a, ErasedReference>;

    fn into_iter(self) -> Self::IntoIter {
        self.references.iter()
    }
}

/// Collects, erases and restores references hidden from unprivileged callers
#[derive(Clone)]
pub struct ReferenceEraser {
    model: Arc<MetaModel>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl ReferenceEraser {
    pub fn new(model: Arc<MetaModel>, gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { model, gateway }
    }

    /// Walk the loaded graph below `entities` and record every unreadable reference
    ///
    /// Relations that are not loaded are never followed, and an unreadable
    /// entity's own relations are never inspected.
    #[tracing::instrument(skip_all, fields(roots = entities.len()))]
    pub fn collect<F>(&self, entities: &[EntityRef], can_read: F) -> IntegrityResult<ErasedReferenceSet>
    where
        F: Fn(&EntityRef) -> bool,
    {
        let mut visited = VisitedSet::new();
        let mut erased = ErasedReferenceSet::new();
        let mut stack: Vec<EntityRef> = Vec::new();

        for root in entities.iter().rev() {
            if visited.insert(root) {
                stack.push(root.clone());
            }
        }

        while let Some(owner) = stack.pop() {
            let type_name = owner.type_name();
            let mut readable = Vec::new();

            for property in self.model.relation_properties(&type_name) {
                if self.model.descriptor(&property.target_type).is_none() {
                    continue;
                }
                if !owner.is_loaded(&property.name) {
                    continue;
                }

                for reference in owner.references(&property.name) {
                    if can_read(&reference) {
                        if visited.insert(&reference) {
                            readable.push(reference);
                        }
                        continue;
                    }

                    let id = reference.id().ok_or_else(|| {
                        IntegrityError::IllegalState(format!(
                            "Unreadable reference {:?} in '{}.{}' has no identifier",
                            reference, type_name, property.name
                        ))
                    })?;
                    debug!("Erasing {:?} from {:?}.{}", reference, owner, property.name);
                    erased.insert(ErasedReference {
                        owner: owner.clone(),
                        property: property.name.clone(),
                        id,
                    });
                }
            }

            stack.extend(readable.into_iter().rev());
        }

        debug!("Collected {} erased references", erased.len());
        Ok(erased)
    }

    /// Remove every collected reference from its owner's in-memory relation
    ///
    /// Returns the number of references actually removed. Removed ids are
    /// recorded on the owner's security state for a later [`restore`](Self::restore).
    pub fn erase(&self, set: &ErasedReferenceSet) -> usize {
        let mut removed = 0;

        for reference in set {
            let owner = &reference.owner;
            let current = owner.read().relation(&reference.property).clone();
            let erased = match current {
                RelationValue::NotLoaded => {
                    warn!(
                        "{:?}.{} is no longer loaded, cannot erase {}",
                        owner, reference.property, reference.id
                    );
                    0
                }
                RelationValue::Many(items) => {
                    let before = items.len();
                    let kept: Vec<EntityRef> = items
                        .into_iter()
                        .filter(|item| item.id().as_ref() != Some(&reference.id))
                        .collect();
                    let count = before - kept.len();
                    owner.write().set_many(&reference.property, kept);
                    count
                }
                RelationValue::One(Some(item)) if item.id().as_ref() == Some(&reference.id) => {
                    owner.write().set_one(&reference.property, None);
                    1
                }
                RelationValue::One(_) => 0,
            };

            if erased > 0 {
                owner
                    .write()
                    .security_mut()
                    .record(&reference.property, reference.id.clone());
                removed += erased;
            }
        }

        debug!("Erased {} references", removed);
        removed
    }

    /// Re-attach the references erased from `entity`, resolved lazily by id
    ///
    /// New entities have nothing to restore. On success the entity's security
    /// state is cleared.
    #[tracing::instrument(skip_all, fields(entity = ?entity))]
    pub async fn restore(&self, entity: &EntityRef) -> IntegrityResult<usize> {
        let (type_name, erased) = {
            let guard = entity.read();
            if guard.is_new() {
                return Ok(0);
            }
            (guard.type_name().to_string(), guard.security().erased().clone())
        };
        if erased.is_empty() {
            return Ok(0);
        }

        let mut plan = Vec::with_capacity(erased.len());
        for (property_name, ids) in erased {
            let property = self.model.relation(&type_name, &property_name).ok_or_else(|| {
                IntegrityError::IllegalState(format!(
                    "Erased property '{}' is not a relation of '{}'",
                    property_name, type_name
                ))
            })?;
            if property.is_many() && !entity.is_loaded(&property_name) {
                return Err(IntegrityError::RestoreFailure {
                    type_name,
                    property: property_name,
                });
            }
            plan.push((property, property_name, ids));
        }

        // Resolve every reference before the entity is touched.
        let mut resolved = Vec::with_capacity(plan.len());
        for (property, property_name, ids) in plan {
            if property.is_many() {
                let current = entity.references(&property_name);
                let mut missing = Vec::new();
                for id in ids {
                    if current.iter().any(|item| item.id().as_ref() == Some(&id)) {
                        continue;
                    }
                    missing.push(self.gateway.reference(&property.target_type, &id).await?);
                }
                resolved.push((property_name, true, missing));
            } else if let Some(id) = ids.last() {
                let reference = self.gateway.reference(&property.target_type, id).await?;
                resolved.push((property_name, false, vec![reference]));
            }
        }

        let mut restored = 0;
        let mut guard = entity.write();
        for (property_name, many, references) in resolved {
            restored += references.len();
            if many {
                let mut items = guard.relation(&property_name).references();
                items.extend(references);
                guard.set_many(&property_name, items);
            } else {
                guard.set_one(&property_name, references.into_iter().next());
            }
        }
        guard.security_mut().clear();
        drop(guard);

        debug!("Restored {} references", restored);
        Ok(restored)
    }
}
