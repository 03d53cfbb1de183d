//! Inverse policies: declared on a property of another type pointing at the removed entity

use tracing::debug;

use super::{DeletePolicyEngine, Node, ProcessContext};
use crate::error::{IntegrityError, IntegrityResult};
use crate::metadata::RelationProperty;

impl DeletePolicyEngine {
    /// Fail if any row of the declaring family still points at the node
    pub(super) async fn check_inverse_deny(
        &self,
        node: &Node<'_>,
        declaring_type: &str,
        property: &RelationProperty,
    ) -> IntegrityResult<()> {
        for descriptor in self.model.persistent_family(declaring_type) {
            let referenced = self
                .gateway
                .exists_by_relation(&descriptor.name, &property.name, &node.id)
                .await?;
            if referenced {
                debug!(
                    "{:?} is still referenced by {}.{}",
                    node.entity, descriptor.name, property.name
                );
                return Err(IntegrityError::delete_policy(&node.type_name, &descriptor.name));
            }
        }
        Ok(())
    }

    /// Remove every row whose `property` points at the node
    pub(super) async fn cascade_inverse(
        &self,
        node: &Node<'_>,
        declaring_type: &str,
        property: &RelationProperty,
        ctx: &mut ProcessContext,
    ) -> IntegrityResult<()> {
        let rows = self
            .rows_pointing_at(declaring_type, &property.name, &node.id)
            .await?;
        debug!(
            "Cascading {} rows of {}.{} pointing at {:?}",
            rows.len(),
            declaring_type,
            property.name,
            node.entity
        );
        for row in rows {
            self.remove_cascaded(row, ctx).await?;
        }
        Ok(())
    }

    /// Detach every row whose `property` points at the node
    pub(super) async fn unlink_inverse(
        &self,
        node: &Node<'_>,
        declaring_type: &str,
        property: &RelationProperty,
        ctx: &mut ProcessContext,
    ) -> IntegrityResult<()> {
        let rows = self
            .rows_pointing_at(declaring_type, &property.name, &node.id)
            .await?;
        for row in rows {
            if row.read().is_removed() {
                continue;
            }
            self.detach(&row, property, node, ctx)?;
        }
        Ok(())
    }
}
