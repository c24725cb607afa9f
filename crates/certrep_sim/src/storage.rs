//! Simulated storage engine.
//!
//! There is no data: the engine only tracks which local transactions are
//! open so that applied write-sets can pick BF-abort victims, the way a row
//! lock conflict would in a real engine.

use certrep_core::{
    ClientId, ClientMode, ClientState, ReplResult, Seqno, ServerState, StorageTransaction, WsMeta,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Per-server engine shared by every connection's [`SimStorage`].
pub struct SimStorageEngine {
    server: Weak<ServerState>,
    alg_freq: u64,
    rng: Mutex<StdRng>,
    open: Mutex<BTreeSet<ClientId>>,
    bf_attempts: AtomicU64,
    bf_accepted: AtomicU64,
    applied_bytes: AtomicU64,
}

impl SimStorageEngine {
    /// Creates an engine for `server`.
    pub fn new(server: &Arc<ServerState>, alg_freq: u64, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            server: Arc::downgrade(server),
            alg_freq,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            open: Mutex::new(BTreeSet::new()),
            bf_attempts: AtomicU64::new(0),
            bf_accepted: AtomicU64::new(0),
            applied_bytes: AtomicU64::new(0),
        })
    }

    /// Number of BF-aborts attempted.
    pub fn bf_attempts(&self) -> u64 {
        self.bf_attempts.load(Ordering::Relaxed)
    }

    /// Number of BF-aborts the victim accepted.
    pub fn bf_accepted(&self) -> u64 {
        self.bf_accepted.load(Ordering::Relaxed)
    }

    /// Payload bytes applied through this engine.
    pub fn applied_bytes(&self) -> u64 {
        self.applied_bytes.load(Ordering::Relaxed)
    }

    /// Number of local transactions currently open.
    pub fn open_transactions(&self) -> usize {
        self.open.lock().len()
    }

    fn register(&self, id: ClientId) {
        self.open.lock().insert(id);
    }

    fn deregister(&self, id: ClientId) {
        self.open.lock().remove(&id);
    }

    /// Picks a victim once every `alg_freq` calls on average and BF-aborts
    /// it on behalf of `aborter`.
    fn maybe_bf_abort(&self, applier: ClientId, aborter: Seqno) {
        if self.alg_freq == 0 {
            return;
        }
        let victim = {
            let mut rng = self.rng.lock();
            if rng.gen_range(0..self.alg_freq) != 0 {
                return;
            }
            let open = self.open.lock();
            let candidates: Vec<ClientId> =
                open.iter().copied().filter(|id| *id != applier).collect();
            if candidates.is_empty() {
                return;
            }
            candidates[rng.gen_range(0..candidates.len())]
        };
        let Some(client) = self.server.upgrade().and_then(|s| s.client(victim)) else {
            return;
        };
        self.bf_attempts.fetch_add(1, Ordering::Relaxed);
        let accepted = client.bf_abort(aborter);
        if accepted {
            self.bf_accepted.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            victim = victim.as_u64(),
            aborter = aborter.get(),
            accepted,
            "simulated lock conflict"
        );
    }
}

impl std::fmt::Debug for SimStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimStorageEngine")
            .field("alg_freq", &self.alg_freq)
            .field("open", &self.open_transactions())
            .finish_non_exhaustive()
    }
}

/// A connection's view of the [`SimStorageEngine`].
#[derive(Debug)]
pub struct SimStorage {
    engine: Arc<SimStorageEngine>,
    staged: Mutex<Vec<u8>>,
}

impl SimStorage {
    /// Creates connection storage on `engine`.
    pub fn new(engine: Arc<SimStorageEngine>) -> Self {
        Self {
            engine,
            staged: Mutex::new(Vec::new()),
        }
    }

    /// Stages the payload replicated at the next commit.
    pub fn stage(&self, data: &[u8]) {
        self.staged.lock().extend_from_slice(data);
    }
}

impl StorageTransaction for SimStorage {
    fn start(&self, client: &ClientState) -> ReplResult<()> {
        if client.mode() == ClientMode::Replicating {
            self.engine.register(client.id());
        }
        Ok(())
    }

    fn apply(&self, client: &ClientState, meta: &WsMeta, data: &[u8]) -> ReplResult<()> {
        self.engine.maybe_bf_abort(client.id(), meta.seqno());
        self.engine
            .applied_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn commit(&self, client: &ClientState) -> ReplResult<()> {
        self.engine.deregister(client.id());
        Ok(())
    }

    fn rollback(&self, client: &ClientState) -> ReplResult<()> {
        self.staged.lock().clear();
        self.engine.deregister(client.id());
        Ok(())
    }

    fn prepare_data_for_replication(&self, client: &ClientState) -> ReplResult<()> {
        let staged = std::mem::take(&mut *self.staged.lock());
        if staged.is_empty() {
            return Ok(());
        }
        client.append_data(&staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certrep_core::{MockProvider, ServerConfig, TransactionState};

    fn server() -> (Arc<ServerState>, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::new());
        let server = ServerState::new(ServerConfig::new().name("sim"), provider.clone());
        (server, provider)
    }

    fn open_local(
        server: &ServerState,
        engine: &Arc<SimStorageEngine>,
    ) -> (Arc<ClientState>, Arc<SimStorage>) {
        let storage = Arc::new(SimStorage::new(Arc::clone(engine)));
        let client = server
            .open_client(ClientMode::Replicating, storage.clone())
            .unwrap();
        client.before_command().unwrap();
        client.before_statement().unwrap();
        client.begin().unwrap();
        (client, storage)
    }

    #[test]
    fn open_transactions_are_tracked() {
        let (server, _provider) = server();
        let engine = SimStorageEngine::new(&server, 0, 1);
        let (client, storage) = open_local(&server, &engine);
        assert_eq!(engine.open_transactions(), 1);

        storage.rollback(&client).unwrap();
        assert_eq!(engine.open_transactions(), 0);
    }

    #[test]
    fn every_apply_aborts_when_frequency_is_one() {
        let (server, provider) = server();
        let engine = SimStorageEngine::new(&server, 1, 7);
        let (victim, _storage) = open_local(&server, &engine);

        let applier_storage = SimStorage::new(Arc::clone(&engine));
        let meta = provider.foreign_meta(
            certrep_core::TransactionId::new(900),
            Seqno::new(1),
            certrep_core::WsFlags::START_TRANSACTION | certrep_core::WsFlags::COMMIT,
        );
        let applier = server
            .open_client(ClientMode::Applier, Arc::new(SimStorage::new(Arc::clone(&engine))))
            .unwrap();
        applier_storage.apply(&applier, &meta, b"row").unwrap();

        assert_eq!(engine.bf_attempts(), 1);
        assert_eq!(engine.bf_accepted(), 1);
        assert_eq!(engine.applied_bytes(), 3);
        assert_eq!(victim.transaction_state(), TransactionState::MustAbort);
    }

    #[test]
    fn disabled_frequency_never_aborts() {
        let (server, provider) = server();
        let engine = SimStorageEngine::new(&server, 0, 7);
        let (victim, storage) = open_local(&server, &engine);
        let meta = provider.foreign_meta(
            certrep_core::TransactionId::new(901),
            Seqno::new(1),
            certrep_core::WsFlags::COMMIT,
        );
        for _ in 0..10 {
            storage.apply(&victim, &meta, b"").unwrap();
        }
        assert_eq!(engine.bf_attempts(), 0);
        assert_eq!(victim.transaction_state(), TransactionState::Executing);
    }
}
