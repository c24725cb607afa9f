//! Simulator errors.

use certrep_core::ReplError;
use thiserror::Error;

/// Result type for simulator operations.
pub type SimResult<T> = Result<T, SimError>;

/// Errors that stop a simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    /// The parameters cannot describe a cluster.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Replication error outside a client thread.
    #[error("replication error: {0}")]
    Repl(#[from] ReplError),

    /// A server did not reach the synced state in time.
    #[error("{server} did not sync")]
    SyncTimeout {
        /// Server name.
        server: String,
    },

    /// A client thread hit a fatal error.
    #[error("client {client} on {server} failed: {source}")]
    Client {
        /// Server name.
        server: String,
        /// Client index on the server.
        client: usize,
        /// The error.
        source: ReplError,
    },

    /// A server recorded a fatal error.
    #[error("{server} stopped: {message}")]
    ServerFatal {
        /// Server name.
        server: String,
        /// The recorded error.
        message: String,
    },

    /// A worker thread panicked.
    #[error("worker {0} panicked")]
    WorkerPanicked(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
