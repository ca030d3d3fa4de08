//! Error types for pigeonhole
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! mirror the failure classes the service distinguishes at its boundary:
//! argument validation, missing resources, uniqueness violations, allocator
//! exhaustion, pool capacity, optimistic-concurrency conflicts, caller
//! cancellation, and store failures.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {field}: {message}")]
    InvalidArgument { field: String, message: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("exhausted: {resource}")]
    Exhausted { resource: String },

    #[error("pool {pool} is at maximum capacity ({maximum})")]
    Capacity { pool: String, maximum: u64 },

    #[error("no free addresses in pool {pool}")]
    NoFree { pool: String },

    #[error("transaction retries exhausted during {operation}")]
    Conflict { operation: String },

    #[error("operation '{operation}' cancelled")]
    Cancelled { operation: String },

    #[error("invalid filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("store operation '{operation}' failed")]
    Store {
        operation: String,
        #[source]
        source: BoxedError,
    },

    #[error("serialization during '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: BoxedError,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Error::NotFound {
            resource: resource.into(),
        }
    }

    pub fn already_exists(resource: impl Into<String>) -> Self {
        Error::AlreadyExists {
            resource: resource.into(),
        }
    }

    pub fn store(operation: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        Error::Store {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn serialization(operation: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        Error::Serialization {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation can reasonably succeed.
    ///
    /// Guard failures and store hiccups are transient; argument, lookup,
    /// uniqueness, and capacity failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::Store { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Conflict {
            operation: "allocate".into()
        }
        .is_retryable());
        assert!(!Error::not_found("network x").is_retryable());
        assert!(!Error::Capacity {
            pool: "p".into(),
            maximum: 3
        }
        .is_retryable());
        assert!(!Error::invalid_argument("cidr", "host bits set").is_retryable());
    }
}
