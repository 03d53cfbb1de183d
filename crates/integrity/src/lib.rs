//! # elif-integrity: Referential integrity for elif.rs entity graphs
//!
//! Applies declared DENY / CASCADE / UNLINK delete policies to a partially
//! loaded graph before an entity is removed, scheduling raw statements for
//! links that were never loaded, and erases references an unprivileged
//! caller may not read (restoring them before the entity is saved again).

pub mod error;
pub mod config;
pub mod entity;
pub mod metadata;
pub mod gateway;
pub mod deferred;
pub mod postgres;
pub mod delete_policy;
pub mod security;

// Re-export core types
pub use error::*;
pub use config::*;
pub use entity::*;
pub use metadata::*;
pub use gateway::{GatewayCall, InMemoryGateway, PersistenceGateway};
pub use deferred::*;
pub use delete_policy::{DeletePolicyEngine, ProcessContext, VisitedSet};
pub use security::{ErasedReference, ErasedReferenceSet, ReferenceEraser};
