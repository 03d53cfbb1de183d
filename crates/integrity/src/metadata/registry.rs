//! MetaModel - statically registered type, relation and policy table
//!
//! Declarations are collected through [`MetaModelBuilder`], validated once
//! and frozen. Policy lookups are precomputed per type so traversal only
//! consults plain data.

use std::collections::{HashMap, HashSet};

use super::policy::{DeletePolicy, PolicyDirection};
use super::types::{RelationProperty, TypeDescriptor};
use crate::entity::EntityRef;
use crate::error::{IntegrityError, IntegrityResult};

/// A delete policy bound to the property that declares it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredPolicy {
    /// Type that declares `property`
    pub declaring_type: String,
    pub property: RelationProperty,
    pub policy: DeletePolicy,
    pub direction: PolicyDirection,
}

/// Collects type and relation declarations before validation
#[derive(Debug, Clone, Default)]
pub struct MetaModelBuilder {
    types: Vec<TypeDescriptor>,
    relations: Vec<(String, RelationProperty)>,
}

impl MetaModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type descriptor
    pub fn entity(mut self, descriptor: TypeDescriptor) -> Self {
        self.types.push(descriptor);
        self
    }

    /// Register a relation property declared on `owner`
    pub fn relation(mut self, owner: impl Into<String>, property: RelationProperty) -> Self {
        self.relations.push((owner.into(), property));
        self
    }

    /// Validate the declarations and freeze them into a [`MetaModel`]
    pub fn build(self) -> IntegrityResult<MetaModel> {
        let mut types = HashMap::new();
        let mut order = Vec::new();

        for descriptor in self.types {
            if types.contains_key(&descriptor.name) {
                return Err(IntegrityError::IllegalState(format!(
                    "Type '{}' is registered twice",
                    descriptor.name
                )));
            }
            order.push(descriptor.name.clone());
            types.insert(descriptor.name.clone(), descriptor);
        }

        let mut model = MetaModel {
            types,
            order,
            relations: HashMap::new(),
            declarations: Vec::new(),
            forward: HashMap::new(),
            inverse: HashMap::new(),
        };

        model.validate_hierarchy()?;

        for (owner, property) in self.relations {
            model.require(&owner)?;
            model.require(&property.target_type).map_err(|_| {
                IntegrityError::IllegalState(format!(
                    "Relation '{}.{}' targets unknown type '{}'",
                    owner, property.name, property.target_type
                ))
            })?;
            property.validate(&owner)?;

            let declared = model.relations.entry(owner.clone()).or_default();
            if declared.iter().any(|existing| existing.name == property.name) {
                return Err(IntegrityError::IllegalState(format!(
                    "Relation '{}.{}' is declared twice",
                    owner, property.name
                )));
            }
            declared.push(property.clone());
            model.declarations.push((owner, property));
        }

        model.validate_relations()?;
        model.index_policies();

        Ok(model)
    }
}

/// Frozen metadata describing entity types, their relations and delete policies
#[derive(Debug, Clone)]
pub struct MetaModel {
    types: HashMap<String, TypeDescriptor>,
    /// Type names in registration order
    order: Vec<String>,
    /// Own relations per type in declaration order
    relations: HashMap<String, Vec<RelationProperty>>,
    /// Every `(owner, property)` in declaration order
    declarations: Vec<(String, RelationProperty)>,
    forward: HashMap<String, Vec<DeclaredPolicy>>,
    inverse: HashMap<String, Vec<DeclaredPolicy>>,
}

impl MetaModel {
    pub fn builder() -> MetaModelBuilder {
        MetaModelBuilder::new()
    }

    pub fn descriptor(&self, type_name: &str) -> Option<&TypeDescriptor> {
        self.types.get(type_name)
    }

    /// Descriptor lookup failing on unknown types
    pub fn require(&self, type_name: &str) -> IntegrityResult<&TypeDescriptor> {
        self.descriptor(type_name).ok_or_else(|| {
            IntegrityError::IllegalState(format!("Unknown entity type '{}'", type_name))
        })
    }

    /// Descriptor of the entity's type
    pub fn type_of(&self, entity: &EntityRef) -> IntegrityResult<&TypeDescriptor> {
        let type_name = entity.type_name();
        self.require(&type_name)
    }

    /// Ancestors of `type_name`, nearest first
    pub fn ancestors_of(&self, type_name: &str) -> Vec<&TypeDescriptor> {
        let mut ancestors = Vec::new();
        let mut current = self.descriptor(type_name).and_then(|d| d.parent.as_deref());
        while let Some(parent) = current {
            match self.descriptor(parent) {
                Some(descriptor) => {
                    ancestors.push(descriptor);
                    current = descriptor.parent.as_deref();
                }
                None => break,
            }
        }
        ancestors
    }

    /// All descendants of `type_name` at any depth, in registration order
    pub fn descendants_of(&self, type_name: &str) -> Vec<&TypeDescriptor> {
        self.order
            .iter()
            .filter(|name| name.as_str() != type_name)
            .filter(|name| self.is_or_descends_from(name, type_name))
            .filter_map(|name| self.descriptor(name))
            .collect()
    }

    /// Returns true if `candidate` is `base` or inherits from it
    pub fn is_or_descends_from(&self, candidate: &str, base: &str) -> bool {
        candidate == base
            || self
                .ancestors_of(candidate)
                .iter()
                .any(|ancestor| ancestor.name == base)
    }

    /// `type_name` followed by its ancestors, nearest first
    pub fn chain<'a>(&'a self, type_name: &'a str) -> Vec<&'a str> {
        let mut chain = vec![type_name];
        chain.extend(self.ancestors_of(type_name).into_iter().map(|d| d.name.as_str()));
        chain
    }

    /// Own and inherited relation properties, own first then ancestors nearest-first
    pub fn relation_properties(&self, type_name: &str) -> Vec<&RelationProperty> {
        self.chain(type_name)
            .into_iter()
            .filter_map(|name| self.relations.get(name))
            .flat_map(|properties| properties.iter())
            .collect()
    }

    /// Own or inherited relation property by name
    pub fn relation(&self, type_name: &str, property: &str) -> Option<&RelationProperty> {
        self.relation_properties(type_name)
            .into_iter()
            .find(|relation| relation.name == property)
    }

    /// The type in `type_name`'s chain that declares `property`
    pub fn declaring_type(&self, type_name: &str, property: &str) -> Option<&TypeDescriptor> {
        self.chain(type_name)
            .into_iter()
            .find(|name| {
                self.relations
                    .get(*name)
                    .map(|properties| properties.iter().any(|relation| relation.name == property))
                    .unwrap_or(false)
            })
            .and_then(|name| self.descriptor(name))
    }

    /// The reciprocal property declared on the target type
    pub fn inverse_of(&self, property: &RelationProperty) -> Option<&RelationProperty> {
        let inverse = property.inverse.as_deref()?;
        self.relation(&property.target_type, inverse)
    }

    pub fn is_loaded(&self, entity: &EntityRef, property: &str) -> bool {
        entity.is_loaded(property)
    }

    /// Forward policies applying to entities of `type_name`
    pub fn forward_policies(&self, type_name: &str) -> &[DeclaredPolicy] {
        self.forward.get(type_name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Inverse policies of other types' properties pointing at `type_name` or its ancestors
    pub fn inverse_policies(&self, type_name: &str) -> &[DeclaredPolicy] {
        self.inverse.get(type_name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `type_name` and its descendants that are persistent
    pub fn persistent_family(&self, type_name: &str) -> Vec<&TypeDescriptor> {
        let mut family: Vec<&TypeDescriptor> = self.descriptor(type_name).into_iter().collect();
        family.extend(self.descendants_of(type_name));
        family.retain(|descriptor| descriptor.persistent);
        family
    }

    /// Registered type names in registration order
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    fn validate_hierarchy(&self) -> IntegrityResult<()> {
        for name in &self.order {
            let mut seen = HashSet::new();
            seen.insert(name.as_str());
            let mut current = self.types[name].parent.as_deref();

            while let Some(parent) = current {
                let descriptor = self.descriptor(parent).ok_or_else(|| {
                    IntegrityError::IllegalState(format!(
                        "Type '{}' extends unknown type '{}'",
                        name, parent
                    ))
                })?;
                if !seen.insert(parent) {
                    return Err(IntegrityError::IllegalState(format!(
                        "Inheritance cycle detected through type '{}'",
                        parent
                    )));
                }
                current = descriptor.parent.as_deref();
            }
        }
        Ok(())
    }

    fn validate_relations(&self) -> IntegrityResult<()> {
        for (owner, property) in &self.declarations {
            if let Some(ref inverse) = property.inverse {
                let reciprocal = self.relation(&property.target_type, inverse).ok_or_else(|| {
                    IntegrityError::IllegalState(format!(
                        "Relation '{}.{}' names inverse '{}' which is not declared on '{}'",
                        owner, property.name, inverse, property.target_type
                    ))
                })?;
                if !self.is_or_descends_from(owner, &reciprocal.target_type)
                    && !self.is_or_descends_from(&reciprocal.target_type, owner)
                {
                    return Err(IntegrityError::IllegalState(format!(
                        "Inverse '{}.{}' of '{}.{}' targets '{}'",
                        property.target_type, inverse, owner, property.name, reciprocal.target_type
                    )));
                }
            }

            if property.on_delete_inverse.is_some() && self.persistent_family(owner).is_empty() {
                return Err(IntegrityError::IllegalState(format!(
                    "Inverse delete policy on '{}.{}' is declared on a non-persistent type without persistent descendants",
                    owner, property.name
                )));
            }
        }
        Ok(())
    }

    fn index_policies(&mut self) {
        let mut forward = HashMap::new();
        let mut inverse = HashMap::new();

        for type_name in &self.order {
            let chain = self.chain(type_name);

            let mut own_forward = Vec::new();
            for link in &chain {
                for property in self.relations.get(*link).into_iter().flatten() {
                    if let Some(policy) = property.on_delete {
                        own_forward.push(DeclaredPolicy {
                            declaring_type: link.to_string(),
                            property: property.clone(),
                            policy,
                            direction: PolicyDirection::Forward,
                        });
                    }
                }
            }

            let mut own_inverse = Vec::new();
            for link in &chain {
                for (owner, property) in &self.declarations {
                    if property.target_type != *link {
                        continue;
                    }
                    if let Some(policy) = property.on_delete_inverse {
                        own_inverse.push(DeclaredPolicy {
                            declaring_type: owner.clone(),
                            property: property.clone(),
                            policy,
                            direction: PolicyDirection::Inverse,
                        });
                    }
                }
            }

            forward.insert(type_name.clone(), own_forward);
            inverse.insert(type_name.clone(), own_inverse);
        }

        self.forward = forward;
        self.inverse = inverse;
    }
}
