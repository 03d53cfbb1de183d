//! Persistence gateway - the narrow store surface the engines consume
//!
//! The engines never load whole graphs through this trait; every read is
//! either an existence check, an identity lookup or a query for the rows
//! pointing at one entity.

pub mod memory;

use async_trait::async_trait;

use crate::deferred::{DeferredStatement, SqlParam};
use crate::entity::{EntityId, EntityRef};
use crate::error::IntegrityResult;

pub use memory::{GatewayCall, InMemoryGateway};

/// Store operations used by the delete-policy engine and the reference eraser
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Remove a managed instance (soft or physical, per its type)
    async fn remove(&self, entity: &EntityRef) -> IntegrityResult<()>;

    /// Rows of exactly `type_name` whose `property` references `target_id`
    async fn query_by_relation(
        &self,
        type_name: &str,
        property: &str,
        target_id: &EntityId,
    ) -> IntegrityResult<Vec<EntityRef>>;

    /// Whether at least one row of `type_name` has `property` referencing `target_id`
    async fn exists_by_relation(
        &self,
        type_name: &str,
        property: &str,
        target_id: &EntityId,
    ) -> IntegrityResult<bool>;

    /// Members of a collection that has no inverse property
    async fn query_collection(
        &self,
        owner_type: &str,
        property: &str,
        owner_id: &EntityId,
    ) -> IntegrityResult<Vec<EntityRef>>;

    /// Whether a collection that has no inverse property holds any member
    async fn collection_exists(
        &self,
        owner_type: &str,
        property: &str,
        owner_id: &EntityId,
    ) -> IntegrityResult<bool>;

    /// Identifier held by a single-valued reference, read as one column
    async fn find_reference_id(
        &self,
        owner_type: &str,
        property: &str,
        owner_id: &EntityId,
    ) -> IntegrityResult<Option<EntityId>>;

    /// Lazy reference to the row of `type_name` identified by `id`
    async fn reference(&self, type_name: &str, id: &EntityId) -> IntegrityResult<EntityRef>;

    /// Execute a raw statement, returning the affected row count
    async fn execute_update(&self, sql: &str, params: &[SqlParam]) -> IntegrityResult<u64>;

    /// Execute a deferred statement; stores that understand its shape may apply it directly
    async fn execute_statement(&self, statement: &DeferredStatement) -> IntegrityResult<u64> {
        self.execute_update(&statement.sql, &statement.params).await
    }
}
