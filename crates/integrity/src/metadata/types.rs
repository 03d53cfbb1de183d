//! Type and relation descriptors

use serde::{Deserialize, Serialize};

use super::policy::DeletePolicy;
use crate::error::{IntegrityError, IntegrityResult};

/// Number of entities a relation property can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[serde(alias = "ONE")]
    One,
    #[serde(alias = "MANY")]
    Many,
}

impl Cardinality {
    pub fn is_many(self) -> bool {
        matches!(self, Cardinality::Many)
    }
}

/// Link table backing an owning many-valued relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTable {
    /// The link table name
    pub table: String,
    /// Column referencing the owner of the collection
    pub owner_column: String,
    /// Column referencing the collection member
    pub target_column: String,
}

impl JoinTable {
    pub fn new(
        table: impl Into<String>,
        owner_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_column: owner_column.into(),
            target_column: target_column.into(),
        }
    }

    pub fn validate(&self) -> IntegrityResult<()> {
        if self.table.is_empty() || self.owner_column.is_empty() || self.target_column.is_empty() {
            return Err(IntegrityError::IllegalState(
                "Join table name and columns cannot be empty".to_string(),
            ));
        }
        if self.owner_column == self.target_column {
            return Err(IntegrityError::IllegalState(format!(
                "Join table '{}' owner and target columns must be different",
                self.table
            )));
        }
        Ok(())
    }
}

/// Descriptor of a domain type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Type name as carried by entities
    pub name: String,
    /// Backing table
    pub table: String,
    /// Primary key column
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Direct ancestor type
    #[serde(default)]
    pub parent: Option<String>,
    /// Whether rows of this type are stored
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    /// Whether removal flags the row instead of deleting it
    #[serde(default)]
    pub soft_delete: bool,
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_persistent() -> bool {
    true
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: default_primary_key(),
            parent: None,
            persistent: true,
            soft_delete: false,
        }
    }

    /// Non-persistent base type (mapped superclass)
    pub fn abstract_base(name: impl Into<String>) -> Self {
        Self {
            persistent: false,
            ..Self::new(name, String::new())
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn with_soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }
}

/// Declared relationship property of a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationProperty {
    pub name: String,
    pub target_type: String,
    pub cardinality: Cardinality,
    /// Whether this side holds the physical link
    #[serde(default)]
    pub owning_side: bool,
    /// Foreign key column for owning single-valued relations
    #[serde(default)]
    pub column: Option<String>,
    /// Link table for owning many-valued relations
    #[serde(default)]
    pub join_table: Option<JoinTable>,
    /// Reciprocal property declared on `target_type`
    #[serde(default)]
    pub inverse: Option<String>,
    /// Policy for the referenced entities when the owner is deleted
    #[serde(default)]
    pub on_delete: Option<DeletePolicy>,
    /// Policy for the owner when a referenced entity is deleted
    #[serde(default)]
    pub on_delete_inverse: Option<DeletePolicy>,
}

impl RelationProperty {
    /// Owning single-valued relation stored in `column`
    pub fn many_to_one(
        name: impl Into<String>,
        target_type: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target_type: target_type.into(),
            cardinality: Cardinality::One,
            owning_side: true,
            column: Some(column.into()),
            join_table: None,
            inverse: None,
            on_delete: None,
            on_delete_inverse: None,
        }
    }

    /// Inverse collection mapped by `inverse` on the target type
    pub fn one_to_many(
        name: impl Into<String>,
        target_type: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target_type: target_type.into(),
            cardinality: Cardinality::Many,
            owning_side: false,
            column: None,
            join_table: None,
            inverse: Some(inverse.into()),
            on_delete: None,
            on_delete_inverse: None,
        }
    }

    /// Inverse single-valued relation mapped by `inverse` on the target type
    pub fn one_to_one_inverse(
        name: impl Into<String>,
        target_type: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::One,
            ..Self::one_to_many(name, target_type, inverse)
        }
    }

    /// Owning collection backed by a link table
    pub fn many_to_many(
        name: impl Into<String>,
        target_type: impl Into<String>,
        join_table: JoinTable,
    ) -> Self {
        Self {
            name: name.into(),
            target_type: target_type.into(),
            cardinality: Cardinality::Many,
            owning_side: true,
            column: None,
            join_table: Some(join_table),
            inverse: None,
            on_delete: None,
            on_delete_inverse: None,
        }
    }

    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    pub fn on_delete(mut self, policy: DeletePolicy) -> Self {
        self.on_delete = Some(policy);
        self
    }

    pub fn on_delete_inverse(mut self, policy: DeletePolicy) -> Self {
        self.on_delete_inverse = Some(policy);
        self
    }

    pub fn is_many(&self) -> bool {
        self.cardinality.is_many()
    }

    /// Validate the property in isolation
    pub fn validate(&self, owner: &str) -> IntegrityResult<()> {
        if self.name.is_empty() {
            return Err(IntegrityError::IllegalState(format!(
                "Relation on '{}' must have a name",
                owner
            )));
        }

        if self.owning_side && !self.is_many() && self.column.is_none() {
            return Err(IntegrityError::IllegalState(format!(
                "Owning relation '{}.{}' must declare a foreign key column",
                owner, self.name
            )));
        }

        if let Some(ref join) = self.join_table {
            if !self.is_many() {
                return Err(IntegrityError::IllegalState(format!(
                    "Relation '{}.{}' declares a join table but is single-valued",
                    owner, self.name
                )));
            }
            join.validate()?;
        }

        Ok(())
    }
}
