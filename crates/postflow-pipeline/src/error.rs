//! Error types for the publishing pipeline.

/// The result type used throughout postflow-pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while advancing ledger items.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// The change queue could not be reached.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A ledger item was not found.
    #[error("ledger item not found: {ledger_id}")]
    LedgerNotFound {
        /// The ledger id that was looked up.
        ledger_id: String,
    },

    /// A persisted record or inbound message could not be interpreted.
    ///
    /// Retrying reproduces the same failure.
    #[error("malformed record: {message}")]
    MalformedRecord {
        /// What was malformed.
        message: String,
    },

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// An external collaborator (media generator, channel driver) failed.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        /// Which collaborator failed.
        collaborator: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// A conditional write kept losing races within the retry budget.
    #[error("contention on {resource} after {attempts} attempts")]
    Contention {
        /// The contended resource.
        resource: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// An error from postflow-core.
    #[error("core error: {0}")]
    Core(#[from] postflow_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new malformed record error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new collaborator error.
    #[must_use]
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    /// Returns true if redelivering the triggering message may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { .. }
            | Self::Queue { .. }
            | Self::Collaborator { .. }
            | Self::Contention { .. } => true,
            Self::Core(err) => err.is_retryable(),
            Self::Serialization { .. }
            | Self::LedgerNotFound { .. }
            | Self::MalformedRecord { .. }
            | Self::Configuration { .. } => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
