//! Delete policy declarations

use serde::{Deserialize, Serialize};
use std::fmt;

/// What happens to related rows when an entity is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Refuse the delete while related rows exist
    #[serde(alias = "DENY")]
    Deny,
    /// Delete the related rows as well
    #[serde(alias = "CASCADE")]
    Cascade,
    /// Clear the link and keep the related rows
    #[serde(alias = "UNLINK")]
    Unlink,
}

impl DeletePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletePolicy::Deny => "DENY",
            DeletePolicy::Cascade => "CASCADE",
            DeletePolicy::Unlink => "UNLINK",
        }
    }
}

impl fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side a policy was declared from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyDirection {
    /// Declared on the property of the entity being deleted
    Forward,
    /// Declared on a related type's property that points back at the deleted entity
    Inverse,
}
