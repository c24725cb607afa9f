//! Server configuration.

use crate::types::Id;
use std::fmt;
use std::path::PathBuf;

/// How a BF-aborted transaction of an idle connection is rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackMode {
    /// The victim rolls back itself when its next command starts.
    #[default]
    Async,
    /// The aborter schedules the rollback on the background worker.
    Sync,
}

impl fmt::Display for RollbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackMode::Async => f.write_str("async"),
            RollbackMode::Sync => f.write_str("sync"),
        }
    }
}

/// Configuration for a replicating server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Human readable server name.
    pub name: String,

    /// Server id; random unless set.
    pub id: Id,

    /// Address clients use to reach this server.
    pub address: String,

    /// Working directory for status files.
    pub working_dir: PathBuf,

    /// Rollback policy for BF-aborted idle connections.
    pub rollback_mode: RollbackMode,

    /// Whether local (non-replicated) commits join the commit order when
    /// they carry a seqno.
    pub order_local_commits: bool,

    /// Default debug log level for new connections.
    pub debug_log_level: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            id: Id::random(),
            address: "127.0.0.1".to_string(),
            working_dir: PathBuf::from("."),
            rollback_mode: RollbackMode::Async,
            order_local_commits: false,
            debug_log_level: 0,
        }
    }
}

impl ServerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the server id.
    #[must_use]
    pub const fn id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    /// Sets the incoming address.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Sets the rollback mode.
    #[must_use]
    pub const fn rollback_mode(mut self, mode: RollbackMode) -> Self {
        self.rollback_mode = mode;
        self
    }

    /// Sets whether ordered local commits use the commit-order section.
    #[must_use]
    pub const fn order_local_commits(mut self, value: bool) -> Self {
        self.order_local_commits = value;
        self
    }

    /// Sets the default debug log level.
    #[must_use]
    pub const fn debug_log_level(mut self, level: u32) -> Self {
        self.debug_log_level = level;
        self
    }
}
