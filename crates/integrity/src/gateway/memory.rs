//! In-memory gateway with a recorded call log
//!
//! Rows are `EntityRef`s; persisted links are tracked separately from the
//! rows' in-memory relation values so a row can hold a link that is not
//! loaded in memory.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::PersistenceGateway;
use crate::deferred::{DeferredStatement, SqlParam, StatementKind};
use crate::entity::{Entity, EntityId, EntityRef, RelationValue};
use crate::error::{IntegrityError, IntegrityResult};
use crate::metadata::{JoinTable, MetaModel};

/// One recorded gateway invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Remove { type_name: String, id: Option<EntityId> },
    QueryByRelation { type_name: String, property: String, target_id: EntityId },
    ExistsByRelation { type_name: String, property: String, target_id: EntityId },
    QueryCollection { owner_type: String, property: String, owner_id: EntityId },
    CollectionExists { owner_type: String, property: String, owner_id: EntityId },
    FindReferenceId { owner_type: String, property: String, owner_id: EntityId },
    Reference { type_name: String, id: EntityId },
    ExecuteUpdate { sql: String, params: Vec<SqlParam> },
}

impl GatewayCall {
    /// Returns true for read queries issued against the store
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            GatewayCall::QueryByRelation { .. }
                | GatewayCall::ExistsByRelation { .. }
                | GatewayCall::QueryCollection { .. }
                | GatewayCall::CollectionExists { .. }
                | GatewayCall::FindReferenceId { .. }
        )
    }
}

type LinkKey = (String, EntityId, String);

#[derive(Default)]
struct StoreState {
    rows: Vec<EntityRef>,
    /// Persisted links: (owner type, owner id, property) -> target ids
    links: HashMap<LinkKey, Vec<EntityId>>,
    calls: Vec<GatewayCall>,
    failure: Option<String>,
}

impl StoreState {
    fn live_row(&self, type_name: &str, id: &EntityId) -> Option<EntityRef> {
        self.rows
            .iter()
            .find(|row| {
                let entity = row.read();
                entity.type_name() == type_name
                    && entity.id() == Some(id)
                    && !entity.is_soft_deleted()
            })
            .cloned()
    }

    fn linked_rows(&self, type_name: &str, property: &str, target_id: &EntityId) -> Vec<EntityRef> {
        self.rows
            .iter()
            .filter(|row| {
                let entity = row.read();
                if entity.type_name() != type_name || entity.is_soft_deleted() {
                    return false;
                }
                let Some(id) = entity.id() else {
                    return false;
                };
                self.links
                    .get(&(type_name.to_string(), id.clone(), property.to_string()))
                    .map(|targets| targets.contains(target_id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn link_targets(&self, owner_type: &str, property: &str, owner_id: &EntityId) -> Vec<EntityId> {
        self.links
            .get(&(owner_type.to_string(), owner_id.clone(), property.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

/// Reference [`PersistenceGateway`] backed by process memory
#[derive(Clone)]
pub struct InMemoryGateway {
    model: Arc<MetaModel>,
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryGateway {
    pub fn new(model: Arc<MetaModel>) -> Self {
        Self {
            model,
            state: Arc::new(Mutex::new(StoreState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a row, persisting the links held by its loaded relations
    pub fn insert(&self, entity: &EntityRef) {
        let (type_name, id, relations) = {
            let guard = entity.read();
            let relations: Vec<(String, Vec<EntityId>)> = self
                .model
                .relation_properties(guard.type_name())
                .into_iter()
                .filter_map(|property| match guard.relation(&property.name) {
                    RelationValue::NotLoaded => None,
                    value => Some((
                        property.name.clone(),
                        value.references().iter().filter_map(EntityRef::id).collect(),
                    )),
                })
                .collect();
            (guard.type_name().to_string(), guard.id().cloned(), relations)
        };

        let mut state = self.state();
        if let Some(id) = id {
            for (property, targets) in relations {
                state.links.insert((type_name.clone(), id.clone(), property), targets);
            }
        }
        if !state.rows.iter().any(|row| row.ptr_eq(entity)) {
            state.rows.push(entity.clone());
        }
    }

    /// Store several rows
    pub fn insert_all<'a>(&self, entities: impl IntoIterator<Item = &'a EntityRef>) {
        for entity in entities {
            self.insert(entity);
        }
    }

    /// Persist a link without touching the owner's in-memory state
    pub fn link(&self, owner: &EntityRef, property: &str, target: &EntityId) -> IntegrityResult<()> {
        let (type_name, id) = owner.key().ok_or_else(|| {
            IntegrityError::IllegalState(format!("Cannot link unsaved entity {:?}", owner))
        })?;
        let mut state = self.state();
        let targets = state.links.entry((type_name, id, property.to_string())).or_default();
        if !targets.contains(target) {
            targets.push(target.clone());
        }
        Ok(())
    }

    /// Make every subsequent call fail with `message`
    pub fn fail_with(&self, message: impl Into<String>) {
        self.state().failure = Some(message.into());
    }

    pub fn clear_failure(&self) {
        self.state().failure = None;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of read queries issued so far
    pub fn query_count(&self) -> usize {
        self.state().calls.iter().filter(|call| call.is_query()).count()
    }

    /// Entities removed so far, in call order
    pub fn removed(&self) -> Vec<(String, Option<EntityId>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::Remove { type_name, id } => Some((type_name.clone(), id.clone())),
                _ => None,
            })
            .collect()
    }

    /// Statements executed so far, in call order
    pub fn executed(&self) -> Vec<DeferredStatement> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::ExecuteUpdate { sql, params } => {
                    Some(DeferredStatement::new(sql.clone(), params.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Whether a live row of `type_name` with `id` is stored
    pub fn contains(&self, type_name: &str, id: &EntityId) -> bool {
        self.state().live_row(type_name, id).is_some()
    }

    /// Persisted targets of one link
    pub fn links_of(&self, owner_type: &str, property: &str, owner_id: &EntityId) -> Vec<EntityId> {
        self.state().link_targets(owner_type, property, owner_id)
    }

    /// Whether rows of `type_name` are stored in `table`, directly or through an ancestor
    fn stored_in(&self, type_name: &str, table: &str) -> bool {
        self.model
            .chain(type_name)
            .into_iter()
            .filter_map(|name| self.model.descriptor(name))
            .any(|descriptor| descriptor.table == table)
    }

    fn row_keys_in(&self, state: &StoreState, table: &str, id: &EntityId) -> Vec<(String, EntityId)> {
        state
            .rows
            .iter()
            .filter_map(EntityRef::key)
            .filter(|(type_name, row_id)| row_id == id && self.stored_in(type_name, table))
            .collect()
    }

    fn links_through(&self, state: &StoreState, join: &JoinTable, owner: &EntityId) -> Vec<LinkKey> {
        state
            .links
            .keys()
            .filter(|(owner_type, owner_id, property)| {
                owner_id == owner
                    && self
                        .model
                        .relation(owner_type, property)
                        .and_then(|relation| relation.join_table.as_ref())
                        == Some(join)
            })
            .cloned()
            .collect()
    }

    /// Apply a generated statement to the stored rows and links
    fn apply(&self, state: &mut StoreState, statement: &DeferredStatement) -> u64 {
        match (&statement.kind, statement.params.as_slice()) {
            (StatementKind::NullColumn { table, column, .. }, [id]) => {
                let nulled: Vec<LinkKey> = state
                    .links
                    .keys()
                    .filter(|(owner_type, owner_id, property)| {
                        owner_id == id
                            && self.stored_in(owner_type, table)
                            && self
                                .model
                                .relation(owner_type, property)
                                .and_then(|relation| relation.column.as_deref())
                                == Some(column.as_str())
                    })
                    .cloned()
                    .collect();
                for key in &nulled {
                    state.links.remove(key);
                }
                self.row_keys_in(state, table, id).len() as u64
            }
            (StatementKind::DeleteRow { table, .. }, [id]) => {
                let deleted = self.row_keys_in(state, table, id);
                state.rows.retain(|row| match row.key() {
                    Some(key) => !deleted.contains(&key),
                    None => true,
                });
                state
                    .links
                    .retain(|(owner_type, owner_id, _), _| {
                        !deleted.iter().any(|(t, i)| t == owner_type && i == owner_id)
                    });
                deleted.len() as u64
            }
            (StatementKind::DeleteLink(join), [owner, target]) => {
                let mut affected = 0;
                for key in self.links_through(state, join, owner) {
                    if let Some(targets) = state.links.get_mut(&key) {
                        let before = targets.len();
                        targets.retain(|id| id != target);
                        affected += (before - targets.len()) as u64;
                    }
                }
                affected
            }
            (StatementKind::DeleteLinks(join), [owner]) => self
                .links_through(state, join, owner)
                .iter()
                .filter_map(|key| state.links.remove(key))
                .map(|targets| targets.len() as u64)
                .sum(),
            _ => 0,
        }
    }

    fn record(&self, call: GatewayCall) -> IntegrityResult<MutexGuard<'_, StoreState>> {
        let mut state = self.state();
        state.calls.push(call);
        if let Some(message) = state.failure.clone() {
            return Err(IntegrityError::Gateway(message));
        }
        Ok(state)
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn remove(&self, entity: &EntityRef) -> IntegrityResult<()> {
        let (type_name, id) = {
            let guard = entity.read();
            (guard.type_name().to_string(), guard.id().cloned())
        };
        let soft = self
            .model
            .descriptor(&type_name)
            .map(|descriptor| descriptor.soft_delete)
            .unwrap_or(false);

        let mut state = self.record(GatewayCall::Remove {
            type_name: type_name.clone(),
            id: id.clone(),
        })?;

        {
            let mut guard = entity.write();
            guard.mark_removed();
            if soft {
                guard.mark_soft_deleted(Utc::now());
            }
        }

        if !soft {
            state.rows.retain(|row| !row.same_entity(entity));
            if let Some(id) = id {
                state
                    .links
                    .retain(|(owner_type, owner_id, _), _| !(owner_type == &type_name && owner_id == &id));
            }
        }

        debug!("Removed {:?} (soft: {})", entity, soft);
        Ok(())
    }

    async fn query_by_relation(
        &self,
        type_name: &str,
        property: &str,
        target_id: &EntityId,
    ) -> IntegrityResult<Vec<EntityRef>> {
        let state = self.record(GatewayCall::QueryByRelation {
            type_name: type_name.to_string(),
            property: property.to_string(),
            target_id: target_id.clone(),
        })?;
        Ok(state.linked_rows(type_name, property, target_id))
    }

    async fn exists_by_relation(
        &self,
        type_name: &str,
        property: &str,
        target_id: &EntityId,
    ) -> IntegrityResult<bool> {
        let state = self.record(GatewayCall::ExistsByRelation {
            type_name: type_name.to_string(),
            property: property.to_string(),
            target_id: target_id.clone(),
        })?;
        Ok(!state.linked_rows(type_name, property, target_id).is_empty())
    }

    async fn query_collection(
        &self,
        owner_type: &str,
        property: &str,
        owner_id: &EntityId,
    ) -> IntegrityResult<Vec<EntityRef>> {
        let state = self.record(GatewayCall::QueryCollection {
            owner_type: owner_type.to_string(),
            property: property.to_string(),
            owner_id: owner_id.clone(),
        })?;

        let Some(relation) = self.model.relation(owner_type, property) else {
            return Err(IntegrityError::IllegalState(format!(
                "Unknown relation '{}.{}'",
                owner_type, property
            )));
        };

        let family = self.model.persistent_family(&relation.target_type);
        Ok(state
            .link_targets(owner_type, property, owner_id)
            .iter()
            .filter_map(|id| {
                family
                    .iter()
                    .find_map(|descriptor| state.live_row(&descriptor.name, id))
            })
            .collect())
    }

    async fn collection_exists(
        &self,
        owner_type: &str,
        property: &str,
        owner_id: &EntityId,
    ) -> IntegrityResult<bool> {
        let state = self.record(GatewayCall::CollectionExists {
            owner_type: owner_type.to_string(),
            property: property.to_string(),
            owner_id: owner_id.clone(),
        })?;
        Ok(!state.link_targets(owner_type, property, owner_id).is_empty())
    }

    async fn find_reference_id(
        &self,
        owner_type: &str,
        property: &str,
        owner_id: &EntityId,
    ) -> IntegrityResult<Option<EntityId>> {
        let state = self.record(GatewayCall::FindReferenceId {
            owner_type: owner_type.to_string(),
            property: property.to_string(),
            owner_id: owner_id.clone(),
        })?;
        Ok(state.link_targets(owner_type, property, owner_id).into_iter().next())
    }

    async fn reference(&self, type_name: &str, id: &EntityId) -> IntegrityResult<EntityRef> {
        let state = self.record(GatewayCall::Reference {
            type_name: type_name.to_string(),
            id: id.clone(),
        })?;

        if let Some(row) = state.live_row(type_name, id) {
            return Ok(row);
        }
        let family = self.model.persistent_family(type_name);
        if let Some(row) = family
            .iter()
            .find_map(|descriptor| state.live_row(&descriptor.name, id))
        {
            return Ok(row);
        }
        Ok(Entity::new(type_name, id.clone()).into_ref())
    }

    /// Hand-written SQL is recorded but not interpreted
    async fn execute_update(&self, sql: &str, params: &[SqlParam]) -> IntegrityResult<u64> {
        let _state = self.record(GatewayCall::ExecuteUpdate {
            sql: sql.to_string(),
            params: params.to_vec(),
        })?;
        Ok(0)
    }

    async fn execute_statement(&self, statement: &DeferredStatement) -> IntegrityResult<u64> {
        let mut state = self.record(GatewayCall::ExecuteUpdate {
            sql: statement.sql.clone(),
            params: statement.params.clone(),
        })?;
        let affected = self.apply(&mut state, statement);
        debug!("Applied deferred statement {} ({} rows)", statement, affected);
        Ok(affected)
    }
}
