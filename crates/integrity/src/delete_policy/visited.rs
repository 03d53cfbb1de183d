//! Identity-keyed visited set scoped to one traversal

use std::collections::{HashMap, HashSet};

use crate::entity::{EntityId, EntityRef};

/// Entities already reached during one `process` or `collect` call
///
/// An entity counts as visited when the same allocation was inserted, or
/// when a handle with the same type and primary key was.
#[derive(Debug, Default)]
pub struct VisitedSet {
    /// Keeps each inserted handle alive so addresses cannot be reused
    by_address: HashMap<usize, EntityRef>,
    by_key: HashSet<(String, EntityId)>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        if self.by_address.contains_key(&entity.address()) {
            return true;
        }
        entity
            .key()
            .map(|key| self.by_key.contains(&key))
            .unwrap_or(false)
    }

    /// Mark `entity` visited; returns false if it already was
    pub fn insert(&mut self, entity: &EntityRef) -> bool {
        if self.contains(entity) {
            return false;
        }
        if let Some(key) = entity.key() {
            self.by_key.insert(key);
        }
        self.by_address.insert(entity.address(), entity.clone());
        true
    }

    /// Mark a row visited by key only, for rows handled without an in-memory instance
    pub fn insert_key(&mut self, type_name: &str, id: EntityId) -> bool {
        self.by_key.insert((type_name.to_string(), id))
    }

    pub fn contains_key(&self, type_name: &str, id: &EntityId) -> bool {
        self.by_key.contains(&(type_name.to_string(), id.clone()))
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty() && self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[test]
    fn test_identity_and_key_equivalence() {
        let mut visited = VisitedSet::new();
        let order = Entity::new("Order", 1).into_ref();
        let same_row = Entity::new("Order", 1).into_ref();
        let other = Entity::new("Order", 2).into_ref();

        assert!(visited.insert(&order));
        assert!(!visited.insert(&order.clone()));
        assert!(visited.contains(&same_row));
        assert!(!visited.insert(&same_row));
        assert!(visited.insert(&other));
        assert_eq!(visited.len(), 2);
    }

    #[test]
    fn test_new_entities_are_tracked_by_identity() {
        let mut visited = VisitedSet::new();
        let draft = Entity::transient("Order").into_ref();
        let another = Entity::transient("Order").into_ref();

        assert!(visited.insert(&draft));
        assert!(!visited.insert(&draft));
        assert!(visited.insert(&another));
    }

    #[test]
    fn test_key_only_entries() {
        let mut visited = VisitedSet::new();
        assert!(visited.insert_key("Invoice", EntityId::Int(9)));
        assert!(!visited.insert_key("Invoice", EntityId::Int(9)));
        assert!(visited.contains(&Entity::new("Invoice", 9).into_ref()));
        assert!(visited.contains_key("Invoice", &EntityId::Int(9)));
    }
}
