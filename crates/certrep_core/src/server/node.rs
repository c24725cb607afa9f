//! Node-wide state shared by every connection of a server.

use super::rollback::BackgroundRollbacker;
use crate::config::{RollbackMode, ServerConfig};
use crate::provider::ReplicationProvider;
use crate::stats::ReplicationStats;
use crate::types::{ClientId, TransactionId};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared context handed to each connection.
///
/// Connections hold this rather than the server so that a connection
/// never keeps its own registry alive.
pub(crate) struct NodeContext {
    pub(crate) provider: Arc<dyn ReplicationProvider>,
    pub(crate) stats: ReplicationStats,
    pub(crate) replayers: ReplayerGate,
    pub(crate) rollbacker: BackgroundRollbacker,
    pub(crate) rollback_mode: RollbackMode,
    pub(crate) order_local_commits: bool,
    pub(crate) debug_log_level: u32,
    last_client_id: AtomicU64,
    last_transaction_id: AtomicU64,
}

impl NodeContext {
    pub(crate) fn new(config: &ServerConfig, provider: Arc<dyn ReplicationProvider>) -> Self {
        Self {
            provider,
            stats: ReplicationStats::new(),
            replayers: ReplayerGate::default(),
            rollbacker: BackgroundRollbacker::start(&config.name),
            rollback_mode: config.rollback_mode,
            order_local_commits: config.order_local_commits,
            debug_log_level: config.debug_log_level,
            last_client_id: AtomicU64::new(0),
            last_transaction_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_client_id(&self) -> ClientId {
        ClientId::new(self.last_client_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(self.last_transaction_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Count of in-flight replays.
///
/// Certification waits here so that a replaying transaction is not
/// overtaken by new local write-sets.
#[derive(Default)]
pub(crate) struct ReplayerGate {
    count: Mutex<usize>,
    cond: Condvar,
}

impl ReplayerGate {
    pub(crate) fn enter(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn leave(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub(crate) fn active(&self) -> usize {
        *self.count.lock()
    }

    pub(crate) fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}
