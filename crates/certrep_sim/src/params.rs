//! Simulation parameters.

use crate::error::{SimError, SimResult};
use certrep_core::RollbackMode;
use std::path::PathBuf;

/// Parameters of one simulation run.
#[derive(Debug, Clone)]
pub struct SimParams {
    /// Number of servers in the cluster.
    pub servers: usize,
    /// Client connections per server.
    pub clients: usize,
    /// Transactions each client runs.
    pub transactions: usize,
    /// Size of the key space rows are picked from.
    pub keys: u64,
    /// Applied write-sets BF-abort a random local transaction once every
    /// `alg_freq` applies on average. Zero disables it.
    pub alg_freq: u64,
    /// Rollback policy for BF-aborted idle connections.
    pub rollback_mode: RollbackMode,
    /// Commit through an explicit prepare phase.
    pub two_phase: bool,
    /// Debug log level of every connection.
    pub debug_log_level: u32,
    /// Random seed; picked at random when unset.
    pub seed: Option<u64>,
    /// Status file written for the first server.
    pub reporter_file: Option<PathBuf>,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            servers: 2,
            clients: 4,
            transactions: 100,
            keys: 1_000,
            alg_freq: 0,
            rollback_mode: RollbackMode::Async,
            two_phase: false,
            debug_log_level: 0,
            seed: None,
            reporter_file: None,
        }
    }
}

impl SimParams {
    /// Creates parameters with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of servers.
    #[must_use]
    pub const fn servers(mut self, servers: usize) -> Self {
        self.servers = servers;
        self
    }

    /// Sets the number of clients per server.
    #[must_use]
    pub const fn clients(mut self, clients: usize) -> Self {
        self.clients = clients;
        self
    }

    /// Sets the number of transactions per client.
    #[must_use]
    pub const fn transactions(mut self, transactions: usize) -> Self {
        self.transactions = transactions;
        self
    }

    /// Sets the key space size.
    #[must_use]
    pub const fn keys(mut self, keys: u64) -> Self {
        self.keys = keys;
        self
    }

    /// Sets the artificial BF-abort frequency.
    #[must_use]
    pub const fn alg_freq(mut self, alg_freq: u64) -> Self {
        self.alg_freq = alg_freq;
        self
    }

    /// Sets the rollback mode.
    #[must_use]
    pub const fn rollback_mode(mut self, mode: RollbackMode) -> Self {
        self.rollback_mode = mode;
        self
    }

    /// Enables two-phase commit.
    #[must_use]
    pub const fn two_phase(mut self, two_phase: bool) -> Self {
        self.two_phase = two_phase;
        self
    }

    /// Sets the connection debug log level.
    #[must_use]
    pub const fn debug_log_level(mut self, level: u32) -> Self {
        self.debug_log_level = level;
        self
    }

    /// Fixes the random seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the status file of the first server.
    #[must_use]
    pub fn reporter_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.reporter_file = Some(path.into());
        self
    }

    /// Checks that the run can start.
    pub fn validate(&self) -> SimResult<()> {
        if self.servers == 0 {
            return Err(SimError::InvalidParams("at least one server is required".into()));
        }
        if self.clients == 0 {
            return Err(SimError::InvalidParams("at least one client is required".into()));
        }
        if self.keys == 0 {
            return Err(SimError::InvalidParams("key space must not be empty".into()));
        }
        Ok(())
    }
}
