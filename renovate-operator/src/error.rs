//! Error types for the operator

use renovate_core::parser::ParseError;
use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while orchestrating renovate runs
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Resource or workload absent
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency version mismatch
    #[error("Conflict while updating {0}")]
    Conflict(String),

    /// Log or discovery output malformed
    #[error("Unparsable output: {0}")]
    Unparsable(#[from] ParseError),

    /// Webhook trust failure
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Any other failure of the remote store
    #[error("Store error: {0}")]
    Store(String),

    /// Workload specification could not be built
    #[error("Template error: {0}")]
    Template(String),

    /// Invalid cron expression
    #[error("Invalid schedule '{expression}': {message}")]
    Schedule { expression: String, message: String },

    /// The discovery probe failed
    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl OperatorError {
    /// Create a not found error for a named resource
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a store error from any displayable failure
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(OperatorError::not_found("tools/renovate").is_not_found());
        assert!(OperatorError::Conflict("tools/renovate".into()).is_conflict());
        assert!(!OperatorError::store("boom").is_not_found());

        let parse: OperatorError = ParseError::NoProjectArray { bytes: 3 }.into();
        assert!(matches!(parse, OperatorError::Unparsable(_)));
    }
}
