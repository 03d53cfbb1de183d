//! Schema files - declarative source for the [`MetaModel`]
//!
//! ```yaml
//! entities:
//!   - name: Order
//!     table: orders
//!     relations:
//!       - name: lines
//!         target_type: OrderLine
//!         cardinality: many
//!         inverse: order
//!         on_delete: cascade
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::registry::{MetaModel, MetaModelBuilder};
use super::types::{RelationProperty, TypeDescriptor};
use crate::error::{IntegrityError, IntegrityResult};

/// One entity type together with the relations it declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    #[serde(flatten)]
    pub descriptor: TypeDescriptor,
    #[serde(default)]
    pub relations: Vec<RelationProperty>,
}

/// Top-level schema document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub entities: Vec<EntitySchema>,
}

impl SchemaDefinition {
    pub fn from_yaml_str(source: &str) -> IntegrityResult<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_json_str(source: &str) -> IntegrityResult<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Register every declaration on a builder
    pub fn into_builder(self) -> MetaModelBuilder {
        let mut builder = MetaModelBuilder::new();
        let mut relations = Vec::new();

        for entity in self.entities {
            let owner = entity.descriptor.name.clone();
            builder = builder.entity(entity.descriptor);
            relations.extend(entity.relations.into_iter().map(|r| (owner.clone(), r)));
        }

        // Types first so relations may reference types declared later in the file
        for (owner, relation) in relations {
            builder = builder.relation(owner, relation);
        }
        builder
    }
}

impl MetaModel {
    pub fn from_schema(schema: SchemaDefinition) -> IntegrityResult<Self> {
        debug!("Building metamodel from schema with {} entities", schema.entities.len());
        schema.into_builder().build()
    }

    pub fn from_yaml_str(source: &str) -> IntegrityResult<Self> {
        Self::from_schema(SchemaDefinition::from_yaml_str(source)?)
    }

    pub fn from_json_str(source: &str) -> IntegrityResult<Self> {
        Self::from_schema(SchemaDefinition::from_json_str(source)?)
    }

    /// Load a `.yaml`/`.yml` or `.json` schema file
    pub fn from_path(path: impl AsRef<Path>) -> IntegrityResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&source),
            Some("json") => Self::from_json_str(&source),
            other => Err(IntegrityError::Schema(format!(
                "Unsupported schema file extension {:?} for '{}'",
                other,
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Cardinality, DeletePolicy};
    use std::io::Write;

    const SCHEMA: &str = r#"
entities:
  - name: Order
    table: orders
    relations:
      - name: lines
        target_type: OrderLine
        cardinality: many
        inverse: order
        on_delete: CASCADE
  - name: OrderLine
    table: order_lines
    soft_delete: true
    relations:
      - name: order
        target_type: Order
        cardinality: one
        owning_side: true
        column: order_id
        inverse: lines
"#;

    #[test]
    fn test_yaml_schema_builds_metamodel() {
        let model = MetaModel::from_yaml_str(SCHEMA).unwrap();
        let lines = model.relation("Order", "lines").unwrap();
        assert_eq!(lines.cardinality, Cardinality::Many);
        assert_eq!(lines.on_delete, Some(DeletePolicy::Cascade));
        assert!(model.descriptor("OrderLine").unwrap().soft_delete);
        assert_eq!(model.forward_policies("Order").len(), 1);
    }

    #[test]
    fn test_json_schema_builds_metamodel() {
        let json = r#"{"entities": [{"name": "Tag", "table": "tags"}]}"#;
        let model = MetaModel::from_json_str(json).unwrap();
        assert_eq!(model.descriptor("Tag").unwrap().primary_key, "id");
    }

    #[test]
    fn test_invalid_schema_reports_schema_error() {
        let result = MetaModel::from_yaml_str("entities: [ { name: 1 ");
        assert!(matches!(result, Err(IntegrityError::Schema(_))));
    }

    #[test]
    fn test_from_path_dispatches_on_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(SCHEMA.as_bytes()).unwrap();
        let model = MetaModel::from_path(file.path()).unwrap();
        assert!(model.descriptor("Order").is_some());

        let other = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(matches!(
            MetaModel::from_path(other.path()),
            Err(IntegrityError::Schema(_))
        ));
    }
}
