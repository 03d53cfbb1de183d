//! Error types for the integrity engines
//!
//! Covers policy violations raised by DENY relations, modelling errors
//! detected while building or consulting the metamodel, restore misuse and
//! failures bubbled up from the persistence gateway.

use crate::config::ConfigError;

/// Result type alias for integrity operations
pub type IntegrityResult<T> = Result<T, IntegrityError>;

/// Error types for delete-policy processing and reference erasure
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    /// A DENY policy blocked the delete
    #[error("Unable to delete '{owner_type}': it is referenced by '{blocking_type}' with a DENY delete policy")]
    DeletePolicy {
        owner_type: String,
        blocking_type: String,
    },

    /// The requested policy cannot be carried out with the declared metadata
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Metadata or graph state is inconsistent
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Restore was called against a collection that was never loaded
    #[error("Unable to restore erased references of '{type_name}.{property}': collection is not loaded")]
    RestoreFailure { type_name: String, property: String },

    /// Cascading traversal went deeper than the configured bound
    #[error("Delete policy traversal exceeded the maximum depth of {max_depth}")]
    DepthExceeded { max_depth: usize },

    /// Persistence gateway failure
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Database error while running deferred statements
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema definition could not be read or parsed
    #[error("Schema error: {0}")]
    Schema(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl IntegrityError {
    /// Create a policy violation naming the type being deleted and the blocking type
    pub fn delete_policy(owner_type: impl Into<String>, blocking_type: impl Into<String>) -> Self {
        Self::DeletePolicy {
            owner_type: owner_type.into(),
            blocking_type: blocking_type.into(),
        }
    }

    /// Returns true if a DENY policy caused this error
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::DeletePolicy { .. })
    }

    /// Returns true if this error points at a modelling mistake rather than data
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedOperation(_) | Self::IllegalState(_) | Self::Schema(_) | Self::Config(_)
        )
    }
}

impl From<serde_yaml::Error> for IntegrityError {
    fn from(err: serde_yaml::Error) -> Self {
        IntegrityError::Schema(err.to_string())
    }
}

impl From<serde_json::Error> for IntegrityError {
    fn from(err: serde_json::Error) -> Self {
        IntegrityError::Schema(err.to_string())
    }
}

impl From<std::io::Error> for IntegrityError {
    fn from(err: std::io::Error) -> Self {
        IntegrityError::Schema(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_violation_message_names_both_types() {
        let err = IntegrityError::delete_policy("Department", "Employee");
        let message = err.to_string();
        assert!(message.contains("Department"));
        assert!(message.contains("Employee"));
        assert!(err.is_policy_violation());
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_configuration_error_classification() {
        assert!(IntegrityError::UnsupportedOperation("x".to_string()).is_configuration_error());
        assert!(IntegrityError::IllegalState("x".to_string()).is_configuration_error());
        assert!(!IntegrityError::Gateway("x".to_string()).is_configuration_error());
        assert!(!IntegrityError::DepthExceeded { max_depth: 3 }.is_configuration_error());
    }

    #[test]
    fn test_schema_error_conversion() {
        let err: IntegrityError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, IntegrityError::Schema(_)));
    }
}
