//! Storage engine callbacks.

use super::ClientState;
use crate::error::{ReplError, ReplResult};
use crate::types::WsMeta;
use parking_lot::Mutex;
use std::thread;
use std::time::Duration;

/// Callbacks into the storage engine that owns a connection's data.
///
/// The core never holds the connection lock while calling into storage,
/// so implementations may call back into the [`ClientState`] (for example
/// `append_data` from [`StorageTransaction::prepare_data_for_replication`]).
pub trait StorageTransaction: Send + Sync {
    /// Starts a storage-level transaction.
    fn start(&self, client: &ClientState) -> ReplResult<()>;

    /// Applies a replicated write-set, either on an applier connection or
    /// while replaying a BF-aborted local transaction.
    fn apply(&self, client: &ClientState, meta: &WsMeta, data: &[u8]) -> ReplResult<()>;

    /// Makes the transaction durable.
    fn commit(&self, client: &ClientState) -> ReplResult<()>;

    /// Undoes the transaction.
    fn rollback(&self, client: &ClientState) -> ReplResult<()>;

    /// Hands the write-set payload to the provider before certification.
    fn prepare_data_for_replication(&self, client: &ClientState) -> ReplResult<()>;
}

/// In-memory storage that records callbacks.
///
/// Payload staged with [`MemoryStorage::stage`] is appended to the
/// write-set when the transaction is prepared for replication.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryStorageInner>,
}

#[derive(Debug, Default)]
struct MemoryStorageInner {
    staged: Vec<u8>,
    applied: Vec<Vec<u8>>,
    starts: usize,
    commits: usize,
    rollbacks: usize,
    fail_prepare: bool,
    fail_apply: bool,
    rollback_delay: Option<Duration>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages payload for the next replicated commit.
    pub fn stage(&self, data: &[u8]) {
        self.inner.lock().staged.extend_from_slice(data);
    }

    /// Makes `prepare_data_for_replication` fail.
    pub fn fail_prepare(&self, fail: bool) {
        self.inner.lock().fail_prepare = fail;
    }

    /// Makes `apply` fail.
    pub fn fail_apply(&self, fail: bool) {
        self.inner.lock().fail_apply = fail;
    }

    /// Makes every `rollback` take at least `delay`.
    pub fn rollback_delay(&self, delay: Duration) {
        self.inner.lock().rollback_delay = Some(delay);
    }

    /// Number of started transactions.
    pub fn starts(&self) -> usize {
        self.inner.lock().starts
    }

    /// Number of commits.
    pub fn commits(&self) -> usize {
        self.inner.lock().commits
    }

    /// Number of rollbacks.
    pub fn rollbacks(&self) -> usize {
        self.inner.lock().rollbacks
    }

    /// Payloads applied so far, oldest first.
    pub fn applied(&self) -> Vec<Vec<u8>> {
        self.inner.lock().applied.clone()
    }
}

impl StorageTransaction for MemoryStorage {
    fn start(&self, _client: &ClientState) -> ReplResult<()> {
        self.inner.lock().starts += 1;
        Ok(())
    }

    fn apply(&self, _client: &ClientState, _meta: &WsMeta, data: &[u8]) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_apply {
            return Err(ReplError::storage("apply failed"));
        }
        inner.applied.push(data.to_vec());
        Ok(())
    }

    fn commit(&self, _client: &ClientState) -> ReplResult<()> {
        self.inner.lock().commits += 1;
        Ok(())
    }

    fn rollback(&self, _client: &ClientState) -> ReplResult<()> {
        let delay = self.inner.lock().rollback_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let mut inner = self.inner.lock();
        inner.staged.clear();
        inner.rollbacks += 1;
        Ok(())
    }

    fn prepare_data_for_replication(&self, client: &ClientState) -> ReplResult<()> {
        let staged = {
            let mut inner = self.inner.lock();
            if inner.fail_prepare {
                return Err(ReplError::storage("prepare for replication failed"));
            }
            std::mem::take(&mut inner.staged)
        };
        if staged.is_empty() {
            return Ok(());
        }
        client.append_data(&staged)
    }
}
