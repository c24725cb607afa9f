//! Replication statistics.
//!
//! Counters are shared by every connection of a server and can be read
//! while transactions are in flight.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = server.stats();
//! println!("commits: {}", stats.commits);
//! println!("replays: {}", stats.replays);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Replication counters for one server.
///
/// All counters are monotonically increasing.
#[derive(Debug, Default)]
pub struct ReplicationStats {
    /// Local transactions started.
    transactions_started: AtomicU64,
    /// Local transactions committed.
    commits: AtomicU64,
    /// Local transactions rolled back.
    rollbacks: AtomicU64,
    /// Transactions replayed to completion.
    replays: AtomicU64,
    /// Accepted brute-force aborts.
    bf_aborts: AtomicU64,
    /// Certification failures.
    cert_failures: AtomicU64,
    /// Foreign write-sets applied.
    applied: AtomicU64,
}

impl ReplicationStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bf_abort(&self) {
        self.bf_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cert_failure(&self) {
        self.cert_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of local transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the number of local commits.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns the number of local rollbacks.
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Returns the number of completed replays.
    pub fn replays(&self) -> u64 {
        self.replays.load(Ordering::Relaxed)
    }

    /// Returns the number of accepted BF-aborts.
    pub fn bf_aborts(&self) -> u64 {
        self.bf_aborts.load(Ordering::Relaxed)
    }

    /// Returns the number of certification failures.
    pub fn cert_failures(&self) -> u64 {
        self.cert_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of applied foreign write-sets.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_started: self.transactions_started(),
            commits: self.commits(),
            rollbacks: self.rollbacks(),
            replays: self.replays(),
            bf_aborts: self.bf_aborts(),
            cert_failures: self.cert_failures(),
            applied: self.applied(),
        }
    }
}

/// A point-in-time copy of [`ReplicationStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Local transactions started.
    pub transactions_started: u64,
    /// Local commits.
    pub commits: u64,
    /// Local rollbacks.
    pub rollbacks: u64,
    /// Completed replays.
    pub replays: u64,
    /// Accepted BF-aborts.
    pub bf_aborts: u64,
    /// Certification failures.
    pub cert_failures: u64,
    /// Applied foreign write-sets.
    pub applied: u64,
}

impl StatsSnapshot {
    /// Adds another snapshot into this one.
    pub fn accumulate(&mut self, other: &StatsSnapshot) {
        self.transactions_started += other.transactions_started;
        self.commits += other.commits;
        self.rollbacks += other.rollbacks;
        self.replays += other.replays;
        self.bf_aborts += other.bf_aborts;
        self.cert_failures += other.cert_failures;
        self.applied += other.applied;
    }
}
