//! Error types for the heapscope diagnostic service
//!
//! Two layers of failure exist. [`IntrospectionError`] covers a single object that
//! could not be described, measured or read; callers degrade it to a placeholder and
//! keep going. [`HeapscopeError`] covers genuine faults (enumeration failure, bad
//! configuration, I/O) and is propagated with `?`.

use crate::types::ObjectId;
use thiserror::Error;

/// Failure to introspect one object
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntrospectionError {
    /// The object was reclaimed between enumeration and the query
    #[error("object {0} is no longer live")]
    Vanished(ObjectId),

    /// Reading a named attribute failed
    #[error("{name}: {reason}")]
    AttributeRead { name: String, reason: String },

    /// The object has no usable textual representation
    #[error("unrepresentable: {0}")]
    Unrepresentable(String),

    /// The object cannot be measured by the size estimator
    #[error("object {0} cannot be measured")]
    Unmeasurable(ObjectId),
}

/// Main error type for heapscope operations
#[derive(Error, Debug)]
pub enum HeapscopeError {
    /// Enumerating the heap failed
    #[error("Heap enumeration failed: {0}")]
    Enumeration(String),

    /// Introspection failure surfaced where no placeholder is possible
    #[error("Introspection error: {0}")]
    Introspection(#[from] IntrospectionError),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but holds unusable values
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A blocking census or trace job panicked or was cancelled
    #[error("Background job failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for heapscope operations
pub type Result<T> = std::result::Result<T, HeapscopeError>;

impl From<anyhow::Error> for HeapscopeError {
    fn from(err: anyhow::Error) -> Self {
        HeapscopeError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HeapscopeError::Enumeration("heap lock poisoned".to_string());
        assert_eq!(err.to_string(), "Heap enumeration failed: heap lock poisoned");
    }

    #[test]
    fn test_introspection_conversion() {
        let err: HeapscopeError = IntrospectionError::Vanished(ObjectId(7)).into();
        assert!(matches!(
            err,
            HeapscopeError::Introspection(IntrospectionError::Vanished(ObjectId(7)))
        ));
        assert_eq!(err.to_string(), "Introspection error: object 7 is no longer live");
    }

    #[test]
    fn test_attribute_read_display() {
        let err = IntrospectionError::AttributeRead {
            name: "conn".to_string(),
            reason: "socket closed".to_string(),
        };
        assert_eq!(err.to_string(), "conn: socket closed");
    }
}
