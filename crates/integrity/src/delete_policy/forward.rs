//! Forward policies: declared on the removed entity's own or inherited properties

use tracing::debug;

use super::{DeletePolicyEngine, Node, ProcessContext};
use crate::deferred::DeferredStatement;
use crate::entity::{EntityId, EntityRef};
use crate::error::{IntegrityError, IntegrityResult};
use crate::metadata::RelationProperty;

impl DeletePolicyEngine {
    /// Fail if the node still holds anything through `property`
    pub(super) async fn check_forward_deny(
        &self,
        node: &Node<'_>,
        property: &RelationProperty,
    ) -> IntegrityResult<()> {
        let occupied = if node.entity.is_loaded(&property.name) {
            !node.entity.references(&property.name).is_empty()
        } else if property.is_many() {
            self.collection_holds_any(node, property).await?
        } else {
            self.reference_present(node, property).await?
        };

        if occupied {
            debug!("{:?}.{} is not empty", node.entity, property.name);
            return Err(IntegrityError::delete_policy(&node.type_name, &property.target_type));
        }
        Ok(())
    }

    async fn collection_holds_any(&self, node: &Node<'_>, property: &RelationProperty) -> IntegrityResult<bool> {
        if property.owning_side {
            return self
                .gateway
                .collection_exists(&node.type_name, &property.name, &node.id)
                .await;
        }
        let inverse = self.require_inverse(node, property)?;
        for descriptor in self.model.persistent_family(&property.target_type) {
            if self
                .gateway
                .exists_by_relation(&descriptor.name, &inverse.name, &node.id)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn reference_present(&self, node: &Node<'_>, property: &RelationProperty) -> IntegrityResult<bool> {
        if property.owning_side {
            let id = self
                .gateway
                .find_reference_id(&node.type_name, &property.name, &node.id)
                .await?;
            return Ok(id.is_some());
        }
        let inverse = self.require_inverse(node, property)?;
        for descriptor in self.model.persistent_family(&property.target_type) {
            if self
                .gateway
                .exists_by_relation(&descriptor.name, &inverse.name, &node.id)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove what the node holds through `property`
    pub(super) async fn cascade_forward(
        &self,
        node: &Node<'_>,
        property: &RelationProperty,
        ctx: &mut ProcessContext,
    ) -> IntegrityResult<()> {
        if property.is_many() {
            let members = self.members_of(node, property).await?;
            debug!(
                "Cascading {} members of {:?}.{}",
                members.len(),
                node.entity,
                property.name
            );
            for member in members {
                self.remove_cascaded(member, ctx).await?;
            }
            return Ok(());
        }

        if node.entity.is_loaded(&property.name) {
            let Some(target) = Self::loaded_one(node.entity, &property.name) else {
                return Ok(());
            };
            if !self.belongs_to(node, property, &target).await? {
                debug!("{:?} was reassigned away from {:?}, not cascading", target, node.entity);
                return Ok(());
            }
            if !self.is_soft_delete(&target.type_name()) {
                node.entity.write().set_one(&property.name, None);
            }
            return self.remove_cascaded(target, ctx).await;
        }

        if property.owning_side {
            return self.cascade_unloaded_reference(node, property, ctx).await;
        }

        let inverse = self.require_inverse(node, property)?;
        let rows = self
            .rows_pointing_at(&property.target_type, &inverse.name, &node.id)
            .await?;
        for row in rows {
            self.remove_cascaded(row, ctx).await?;
        }
        Ok(())
    }

    /// Members of a many-valued relation, read from memory when loaded
    async fn members_of(&self, node: &Node<'_>, property: &RelationProperty) -> IntegrityResult<Vec<EntityRef>> {
        if node.entity.is_loaded(&property.name) {
            return Ok(node.entity.references(&property.name));
        }
        if property.owning_side {
            return self
                .gateway
                .query_collection(&node.type_name, &property.name, &node.id)
                .await;
        }
        let inverse = self.require_inverse(node, property)?;
        self.rows_pointing_at(&property.target_type, &inverse.name, &node.id)
            .await
    }

    /// Cascade through a foreign key that was never loaded, without loading the target
    async fn cascade_unloaded_reference(
        &self,
        node: &Node<'_>,
        property: &RelationProperty,
        ctx: &mut ProcessContext,
    ) -> IntegrityResult<()> {
        let Some(target_id) = self
            .gateway
            .find_reference_id(&node.type_name, &property.name, &node.id)
            .await?
        else {
            return Ok(());
        };

        if !self.belongs_by_id(node, property, &target_id).await? {
            debug!(
                "{}#{} was reassigned away from {:?}, not cascading",
                property.target_type, target_id, node.entity
            );
            return Ok(());
        }

        if self.is_soft_delete(&property.target_type) {
            let target = self.gateway.reference(&property.target_type, &target_id).await?;
            return self.remove_cascaded(target, ctx).await;
        }

        if ctx.visited.contains_key(&property.target_type, &target_id) {
            return Ok(());
        }

        let target = self.model.require(&property.target_type)?;
        if !target.persistent || target.table.is_empty() {
            return Err(IntegrityError::IllegalState(format!(
                "Cannot delete '{}' rows through '{}.{}': the type has no table",
                target.name, node.type_name, property.name
            )));
        }
        let column = property.column.as_deref().ok_or_else(|| {
            IntegrityError::IllegalState(format!(
                "Relation '{}.{}' has no foreign key column",
                node.type_name, property.name
            ))
        })?;
        let storage = self.storage_of(&node.type_name, &property.name)?;

        let null_fk = DeferredStatement::null_column(
            &storage.table,
            column,
            &storage.primary_key,
            node.id.clone(),
        )?;
        let delete_target = DeferredStatement::delete_row(&target.table, &target.primary_key, target_id.clone())?;
        self.defer(ctx, null_fk);
        self.defer(ctx, delete_target);
        ctx.visited.insert_key(&property.target_type, target_id);
        Ok(())
    }

    /// Whether `target`, reached through `property`, still points back at the node
    async fn belongs_to(
        &self,
        node: &Node<'_>,
        property: &RelationProperty,
        target: &EntityRef,
    ) -> IntegrityResult<bool> {
        let Some(inverse) = self.model.inverse_of(property) else {
            return Ok(true);
        };
        if inverse.is_many() {
            return Ok(true);
        }
        if target.is_loaded(&inverse.name) {
            return Ok(Self::loaded_one(target, &inverse.name)
                .map(|owner| owner.same_entity(node.entity))
                .unwrap_or(false));
        }
        if !inverse.owning_side {
            return Ok(true);
        }
        let Some((target_type, target_id)) = target.key() else {
            return Ok(true);
        };
        let owner = self
            .gateway
            .find_reference_id(&target_type, &inverse.name, &target_id)
            .await?;
        Ok(owner.as_ref() == Some(&node.id))
    }

    async fn belongs_by_id(
        &self,
        node: &Node<'_>,
        property: &RelationProperty,
        target_id: &EntityId,
    ) -> IntegrityResult<bool> {
        let Some(inverse) = self.model.inverse_of(property) else {
            return Ok(true);
        };
        if inverse.is_many() || !inverse.owning_side {
            return Ok(true);
        }
        let owner = self
            .gateway
            .find_reference_id(&property.target_type, &inverse.name, target_id)
            .await?;
        Ok(owner.as_ref() == Some(&node.id))
    }

    /// Detach what the node holds through `property`
    pub(super) async fn unlink_forward(
        &self,
        node: &Node<'_>,
        property: &RelationProperty,
        ctx: &mut ProcessContext,
    ) -> IntegrityResult<()> {
        if property.is_many() {
            if property.owning_side {
                if node.entity.is_loaded(&property.name) {
                    node.entity.write().set_many(&property.name, Vec::new());
                    return Ok(());
                }
                let join = property.join_table.as_ref().ok_or_else(|| {
                    IntegrityError::IllegalState(format!(
                        "Owning collection '{}.{}' has no join table",
                        node.type_name, property.name
                    ))
                })?;
                let statement = DeferredStatement::delete_links(join, node.id.clone())?;
                self.defer(ctx, statement);
                return Ok(());
            }

            if property.inverse.is_none() {
                return Err(IntegrityError::UnsupportedOperation(format!(
                    "Unable to unlink '{}.{}': the collection is neither owning nor has an inverse",
                    node.type_name, property.name
                )));
            }
            let inverse = self.require_inverse(node, property)?;
            let rows = if node.entity.is_loaded(&property.name) {
                node.entity.references(&property.name)
            } else {
                self.rows_pointing_at(&property.target_type, &inverse.name, &node.id)
                    .await?
            };
            for row in rows {
                if row.read().is_removed() {
                    continue;
                }
                self.detach(&row, inverse, node, ctx)?;
            }
            return Ok(());
        }

        if property.owning_side {
            return self.null_reference(node.entity, property, ctx);
        }

        let inverse = self.require_inverse(node, property)?;
        let holder = if node.entity.is_loaded(&property.name) {
            Self::loaded_one(node.entity, &property.name)
        } else {
            self.rows_pointing_at(&property.target_type, &inverse.name, &node.id)
                .await?
                .into_iter()
                .next()
        };
        let Some(holder) = holder else {
            return Ok(());
        };
        if holder.read().is_removed() {
            return Ok(());
        }
        self.detach(&holder, inverse, node, ctx)
    }

    fn require_inverse<'m>(
        &'m self,
        node: &Node<'_>,
        property: &RelationProperty,
    ) -> IntegrityResult<&'m RelationProperty> {
        self.model.inverse_of(property).ok_or_else(|| {
            IntegrityError::IllegalState(format!(
                "Relation '{}.{}' is not owning and has no inverse on '{}'",
                node.type_name, property.name, property.target_type
            ))
        })
    }
}
