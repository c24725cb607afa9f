//! Error types for the replication core.

use crate::types::TransactionId;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Result type for provider calls. `Ok` is the provider's `success`.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Non-success statuses a replication provider can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Operation succeeded with a warning.
    #[error("warning")]
    Warning,
    /// The provider has no record of the transaction.
    #[error("transaction missing")]
    TransactionMissing,
    /// The write-set failed certification.
    #[error("certification failed")]
    CertificationFailed,
    /// The transaction was brute-force aborted.
    #[error("brute force aborted")]
    BfAbort,
    /// The write-set exceeded the provider size limit.
    #[error("size exceeded")]
    SizeExceeded,
    /// The node lost its connection to the group.
    #[error("connection failed")]
    ConnectionFailed,
    /// The provider failed internally.
    #[error("provider failed")]
    ProviderFailed,
    /// Unrecoverable provider failure.
    #[error("fatal")]
    Fatal,
    /// Operation not implemented by the provider.
    #[error("not implemented")]
    NotImplemented,
    /// Operation not allowed in the current provider state.
    #[error("not allowed")]
    NotAllowed,
}

/// Error class recorded on a connection.
///
/// This is the error a database front end would report back to its client
/// after a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientError {
    /// No error.
    #[default]
    Success,
    /// Commit failed for a non-conflict reason.
    ErrorDuringCommit,
    /// Transaction lost a conflict and was rolled back.
    Deadlock,
    /// Connection was killed while committing.
    Interrupted,
    /// Write-set too large.
    SizeExceeded,
    /// Requested feature is not supported.
    NotSupported,
}

impl ClientError {
    /// Returns true if the error class is a failure.
    #[must_use]
    pub fn is_error(self) -> bool {
        self != ClientError::Success
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientError::Success => "success",
            ClientError::ErrorDuringCommit => "error_during_commit",
            ClientError::Deadlock => "deadlock",
            ClientError::Interrupted => "interrupted",
            ClientError::SizeExceeded => "size_exceeded",
            ClientError::NotSupported => "not_supported",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in replication core operations.
#[derive(Debug, Error)]
pub enum ReplError {
    /// The transaction failed and was (or will be) rolled back.
    #[error("transaction aborted: {0}")]
    Aborted(ClientError),

    /// A transaction state transition outside the legality table.
    #[error("illegal transaction state transition: {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A server state transition outside the legality table.
    #[error("illegal server state transition: {from} -> {to}")]
    IllegalServerTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Provider resources of a transaction were released twice.
    #[error("provider handle of {0} released more than once")]
    DoubleRelease(TransactionId),

    /// The requested path is not implemented.
    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// Unrecoverable failure; the connection or node must stop.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Provider returned an error that has no transaction-level mapping.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Storage engine callback failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReplError {
    /// Creates an illegal transition error.
    pub fn illegal_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates an unimplemented error.
    pub fn unimplemented(what: impl Into<String>) -> Self {
        Self::Unimplemented(what.into())
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the error must stop the node's processing loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplError::IllegalTransition { .. }
                | ReplError::IllegalServerTransition { .. }
                | ReplError::DoubleRelease(_)
                | ReplError::Unimplemented(_)
                | ReplError::Fatal(_)
        )
    }

    /// Returns the connection error class for recoverable failures.
    pub fn client_error(&self) -> Option<ClientError> {
        match self {
            ReplError::Aborted(e) => Some(*e),
            _ => None,
        }
    }

    /// Returns true if the failure was a lost conflict.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, ReplError::Aborted(ClientError::Deadlock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ReplError::fatal("boom").is_fatal());
        assert!(ReplError::unimplemented("streaming").is_fatal());
        assert!(ReplError::illegal_transition("executing", "committed").is_fatal());
        assert!(ReplError::DoubleRelease(TransactionId::new(1)).is_fatal());
        assert!(!ReplError::Aborted(ClientError::Deadlock).is_fatal());
        assert!(!ReplError::Provider(ProviderError::Warning).is_fatal());
    }

    #[test]
    fn client_error_extraction() {
        let err = ReplError::Aborted(ClientError::Deadlock);
        assert_eq!(err.client_error(), Some(ClientError::Deadlock));
        assert!(err.is_deadlock());
        assert_eq!(ReplError::fatal("x").client_error(), None);
    }

    #[test]
    fn error_display() {
        let err = ReplError::illegal_transition("executing", "committed");
        assert_eq!(
            err.to_string(),
            "illegal transaction state transition: executing -> committed"
        );
        assert_eq!(
            ReplError::Provider(ProviderError::CertificationFailed).to_string(),
            "provider error: certification failed"
        );
    }
}
