//! Error types and result aliases for postflow primitives.
//!
//! Conditional-write conflicts are deliberately absent here: a lost CAS race is a
//! normal outcome ([`crate::CasOutcome::Conflict`]), not an error.

use std::fmt;

/// The result type used throughout postflow-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coordination primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage operation failed (store unreachable, poisoned lock, I/O).
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Returns true if retrying the operation may succeed.
    ///
    /// Storage failures are transient; malformed input and missing resources
    /// reproduce on every retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}
