//! Metadata Module - types, relations and delete policies as plain data

pub mod policy;
pub mod types;
pub mod registry;
pub mod schema;

pub use policy::*;
pub use types::*;
pub use registry::*;
pub use schema::*;
