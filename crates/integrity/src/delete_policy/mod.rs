//! Delete Policy Engine - applies DENY / CASCADE / UNLINK before removal
//!
//! For an entity about to be removed the engine visits:
//!
//! 1. inverse policies: properties of other types that point at the entity's
//!    type (or an ancestor) and declare `on_delete_inverse`;
//! 2. forward policies: the entity's own and inherited properties that
//!    declare `on_delete`.
//!
//! All DENY checks of a node run before its CASCADE and UNLINK side effects.
//! Cascaded removals recurse through the same engine. Links to rows that
//! were never loaded are fixed up with statements collected in the
//! [`ProcessContext`] and run right before commit.

mod forward;
mod inverse;
pub mod visited;


use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::IntegrityConfig;
use crate::deferred::{DeferredActions, DeferredStatement};
use crate::entity::{EntityId, EntityRef, RelationValue};
use crate::error::{IntegrityError, IntegrityResult};
use crate::gateway::PersistenceGateway;
use crate::metadata::{DeletePolicy, MetaModel, RelationProperty, TypeDescriptor};

pub use visited::VisitedSet;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-call traversal state
#[derive(Debug, Default)]
pub struct ProcessContext {
    visited: VisitedSet,
    deferred: DeferredActions,
    depth: usize,
}

impl ProcessContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visited(&self) -> &VisitedSet {
        &self.visited
    }

    pub fn deferred(&self) -> &DeferredActions {
        &self.deferred
    }

    pub fn into_deferred(self) -> DeferredActions {
        self.deferred
    }
}

/// The node currently being processed, with its resolved metadata
struct Node<'a> {
    entity: &'a EntityRef,
    type_name: String,
    id: EntityId,
}

/// Applies delete policies reachable from an entity marked for removal
#[derive(Clone)]
pub struct DeletePolicyEngine {
    model: Arc<MetaModel>,
    gateway: Arc<dyn PersistenceGateway>,
    config: IntegrityConfig,
}

impl DeletePolicyEngine {
    pub fn new(
        model: Arc<MetaModel>,
        gateway: Arc<dyn PersistenceGateway>,
        config: IntegrityConfig,
    ) -> Self {
        Self {
            model,
            gateway,
            config,
        }
    }

    pub fn model(&self) -> &MetaModel {
        &self.model
    }

    pub fn config(&self) -> &IntegrityConfig {
        &self.config
    }

    /// Apply every policy reachable from `root` and return the deferred statements
    #[tracing::instrument(skip_all, fields(root = ?root))]
    pub async fn process(&self, root: &EntityRef) -> IntegrityResult<DeferredActions> {
        let mut ctx = ProcessContext::new();
        self.process_in(root, &mut ctx).await?;
        debug!("Delete policies processed, {} deferred statements", ctx.deferred.len());
        Ok(ctx.into_deferred())
    }

    /// Apply policies sharing the visited set and deferred list of `ctx`
    pub async fn process_in(&self, root: &EntityRef, ctx: &mut ProcessContext) -> IntegrityResult<()> {
        if !ctx.visited.insert(root) {
            debug!("{:?} already processed in this unit of work", root);
            return Ok(());
        }
        self.process_node(root.clone(), ctx).await
    }

    /// Mark `root` removed, apply its policies, then remove it through the gateway
    pub async fn delete(&self, root: &EntityRef) -> IntegrityResult<DeferredActions> {
        root.write().mark_removed();
        let deferred = match self.process(root).await {
            Ok(deferred) => deferred,
            Err(e) => {
                root.write().unmark_removed();
                return Err(e);
            }
        };
        self.gateway.remove(root).await?;
        Ok(deferred)
    }

    fn process_node<'a>(
        &'a self,
        entity: EntityRef,
        ctx: &'a mut ProcessContext,
    ) -> BoxFuture<'a, IntegrityResult<()>> {
        Box::pin(async move {
            let (type_name, id) = {
                let guard = entity.read();
                (guard.type_name().to_string(), guard.id().cloned())
            };
            self.model.require(&type_name)?;

            let Some(id) = id else {
                debug!("{:?} was never persisted, no delete policies apply", entity);
                return Ok(());
            };

            let node = Node {
                entity: &entity,
                type_name,
                id,
            };
            let inverse = self.model.inverse_policies(&node.type_name);
            let forward = self.model.forward_policies(&node.type_name);

            for binding in inverse.iter().filter(|b| b.policy == DeletePolicy::Deny) {
                self.check_inverse_deny(&node, &binding.declaring_type, &binding.property)
                    .await?;
            }
            for binding in forward.iter().filter(|b| b.policy == DeletePolicy::Deny) {
                self.check_forward_deny(&node, &binding.property).await?;
            }

            for binding in inverse {
                match binding.policy {
                    DeletePolicy::Deny => {}
                    DeletePolicy::Cascade => {
                        self.cascade_inverse(&node, &binding.declaring_type, &binding.property, ctx)
                            .await?
                    }
                    DeletePolicy::Unlink => {
                        self.unlink_inverse(&node, &binding.declaring_type, &binding.property, ctx)
                            .await?
                    }
                }
            }

            for binding in forward {
                match binding.policy {
                    DeletePolicy::Deny => {}
                    DeletePolicy::Cascade => self.cascade_forward(&node, &binding.property, ctx).await?,
                    DeletePolicy::Unlink => self.unlink_forward(&node, &binding.property, ctx).await?,
                }
            }

            Ok(())
        })
    }

    /// Remove an entity reached through a CASCADE policy
    async fn remove_cascaded(&self, child: EntityRef, ctx: &mut ProcessContext) -> IntegrityResult<()> {
        if child.read().is_removed() {
            if ctx.visited.insert(&child) {
                warn!("{:?} was already removed in this unit of work", child);
            }
            return Ok(());
        }
        if !ctx.visited.insert(&child) {
            debug!("{:?} already visited, skipping cascade", child);
            return Ok(());
        }
        if ctx.depth >= self.config.max_depth {
            return Err(IntegrityError::DepthExceeded {
                max_depth: self.config.max_depth,
            });
        }

        debug!("Cascading removal to {:?}", child);
        child.write().mark_removed();

        ctx.depth += 1;
        let result = self.process_node(child.clone(), ctx).await;
        ctx.depth -= 1;
        if let Err(e) = result {
            child.write().unmark_removed();
            return Err(e);
        }

        self.gateway.remove(&child).await
    }

    /// Whether removal of `type_name` rows flags them instead of deleting
    fn is_soft_delete(&self, type_name: &str) -> bool {
        self.config.soft_delete
            && self
                .model
                .descriptor(type_name)
                .map(|descriptor| descriptor.soft_delete)
                .unwrap_or(false)
    }

    /// Descriptor of the table that stores `property` for rows of `holder_type`
    ///
    /// Properties declared on an abstract base live in the concrete type's table.
    fn storage_of(&self, holder_type: &str, property: &str) -> IntegrityResult<&TypeDescriptor> {
        match self.model.declaring_type(holder_type, property) {
            Some(declaring) if declaring.persistent && !declaring.table.is_empty() => Ok(declaring),
            _ => self.model.require(holder_type),
        }
    }

    fn defer(&self, ctx: &mut ProcessContext, statement: DeferredStatement) {
        if self.config.log_statements {
            debug!("Deferred statement: {}", statement);
        }
        ctx.deferred.register(statement);
    }

    /// Null a single-valued owning reference, in memory when loaded, deferred otherwise
    fn null_reference(
        &self,
        holder: &EntityRef,
        property: &RelationProperty,
        ctx: &mut ProcessContext,
    ) -> IntegrityResult<()> {
        if holder.is_loaded(&property.name) {
            debug!("Clearing {:?}.{} in memory", holder, property.name);
            holder.write().set_one(&property.name, None);
            return Ok(());
        }

        let (holder_type, holder_id) = holder.key().ok_or_else(|| {
            IntegrityError::IllegalState(format!(
                "Cannot clear '{}' on unsaved entity {:?}",
                property.name, holder
            ))
        })?;
        let column = property.column.as_deref().ok_or_else(|| {
            IntegrityError::IllegalState(format!(
                "Relation '{}.{}' has no foreign key column",
                holder_type, property.name
            ))
        })?;
        let storage = self.storage_of(&holder_type, &property.name)?;
        let statement =
            DeferredStatement::null_column(&storage.table, column, &storage.primary_key, holder_id)?;
        self.defer(ctx, statement);
        Ok(())
    }

    /// Drop the link `holder.property -> removed`
    fn detach(
        &self,
        holder: &EntityRef,
        property: &RelationProperty,
        removed: &Node<'_>,
        ctx: &mut ProcessContext,
    ) -> IntegrityResult<()> {
        if !property.is_many() {
            if property.owning_side {
                return self.null_reference(holder, property, ctx);
            }
            debug!(
                "Link {:?}.{} is stored on the removed side, nothing to clear",
                holder, property.name
            );
            return Ok(());
        }

        if property.owning_side {
            if holder.is_loaded(&property.name) {
                let kept: Vec<EntityRef> = holder
                    .references(&property.name)
                    .into_iter()
                    .filter(|member| !member.same_entity(removed.entity))
                    .collect();
                holder.write().set_many(&property.name, kept);
                return Ok(());
            }

            let join = property.join_table.as_ref().ok_or_else(|| {
                IntegrityError::IllegalState(format!(
                    "Owning collection '{}' has no join table",
                    property.name
                ))
            })?;
            let holder_id = holder.id().ok_or_else(|| {
                IntegrityError::IllegalState(format!("Cannot unlink unsaved entity {:?}", holder))
            })?;
            let statement = DeferredStatement::delete_link(join, holder_id, removed.id.clone())?;
            self.defer(ctx, statement);
            return Ok(());
        }

        if property.inverse.is_some() {
            debug!(
                "Collection {:?}.{} is mapped by the removed side, nothing to clear",
                holder, property.name
            );
            return Ok(());
        }

        Err(IntegrityError::UnsupportedOperation(format!(
            "Unable to unlink collection '{}' that is neither owning nor has an inverse",
            property.name
        )))
    }

    /// Rows of `declaring_type` (and its persistent descendants) whose `property` points at `id`
    async fn rows_pointing_at(
        &self,
        declaring_type: &str,
        property: &str,
        id: &EntityId,
    ) -> IntegrityResult<Vec<EntityRef>> {
        let family = self.model.persistent_family(declaring_type);
        if family.is_empty() {
            return Err(IntegrityError::IllegalState(format!(
                "Type '{}' has no persistent type to query '{}' on",
                declaring_type, property
            )));
        }

        let mut rows = Vec::new();
        for descriptor in family {
            rows.extend(
                self.gateway
                    .query_by_relation(&descriptor.name, property, id)
                    .await?,
            );
        }
        Ok(rows)
    }

    /// Loaded single value of `property`, `None` when empty
    fn loaded_one(entity: &EntityRef, property: &str) -> Option<EntityRef> {
        match entity.read().relation(property) {
            RelationValue::One(value) => value.clone(),
            _ => None,
        }
    }
}
