//! Scriptable in-memory provider for tests.

use super::{ApplyTarget, ReplicationProvider, StatusVariable};
use crate::error::{ProviderError, ProviderResult, ReplError, ReplResult};
use crate::types::{
    ClientId, Gtid, Id, Key, Seqno, Stid, TransactionId, WsFlags, WsHandle, WsMeta,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Callback run by the mock at a fixed point of a provider call.
///
/// Hooks run without any mock lock held, so they may call back into the
/// provider or into connections.
pub type MockHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct MockState {
    connected: bool,
    next_seqno: i64,
    certify_result: Option<ProviderError>,
    certify_seqno: Option<Seqno>,
    failed_certify_seqno: Option<Seqno>,
    bf_abort_result: Option<ProviderError>,
    commit_order_enter_result: Option<ProviderError>,
    release_result: Option<ProviderError>,
    started: HashSet<TransactionId>,
    keys: HashMap<TransactionId, Vec<Key>>,
    data: HashMap<TransactionId, Vec<u8>>,
    ordered: HashMap<TransactionId, WsMeta>,
    aborted: HashSet<TransactionId>,
    releases: HashMap<TransactionId, usize>,
    commit_order_enters: usize,
    commit_order_leaves: usize,
    certify_calls: usize,
    replays: usize,
    pending_applies: VecDeque<(WsHandle, WsMeta, Vec<u8>)>,
    sst_sent: Vec<(Gtid, i32)>,
    sst_received: Vec<(Gtid, i32)>,
}

#[derive(Default)]
struct MockHooks {
    after_certify: Option<MockHook>,
    before_commit_order_enter: Option<MockHook>,
}

/// A provider whose outcomes are set by the test.
///
/// By default every call succeeds and certification hands out seqnos
/// 1, 2, 3, ... The mock records how often each handle was released so
/// tests can check the release-exactly-once rule.
pub struct MockProvider {
    server_id: Id,
    group_id: Id,
    state: Mutex<MockState>,
    hooks: Mutex<MockHooks>,
}

impl MockProvider {
    /// Creates a new mock provider.
    pub fn new() -> Self {
        Self {
            server_id: Id::random(),
            group_id: Id::random(),
            state: Mutex::new(MockState {
                next_seqno: 1,
                ..Default::default()
            }),
            hooks: Mutex::new(MockHooks::default()),
        }
    }

    /// Returns the group id used in assigned GTIDs.
    pub fn group_id(&self) -> Id {
        self.group_id
    }

    /// Makes every following `certify` call fail with `error`.
    pub fn set_certify_result(&self, error: Option<ProviderError>) {
        self.state.lock().certify_result = error;
    }

    /// Makes the next successful `certify` assign `seqno`.
    pub fn set_next_seqno(&self, seqno: Seqno) {
        self.state.lock().certify_seqno = Some(seqno);
    }

    /// Makes failed `certify` calls still fill in `seqno`, as providers
    /// that order rejected write-sets do.
    pub fn set_failed_certify_seqno(&self, seqno: Option<Seqno>) {
        self.state.lock().failed_certify_seqno = seqno;
    }

    /// Makes every following `bf_abort` call fail with `error`.
    pub fn set_bf_abort_result(&self, error: Option<ProviderError>) {
        self.state.lock().bf_abort_result = error;
    }

    /// Makes every following `commit_order_enter` call fail with `error`.
    pub fn set_commit_order_enter_result(&self, error: Option<ProviderError>) {
        self.state.lock().commit_order_enter_result = error;
    }

    /// Makes every following `release` call fail with `error`. The release
    /// is still counted.
    pub fn set_release_result(&self, error: Option<ProviderError>) {
        self.state.lock().release_result = error;
    }

    /// Installs a hook run after a successful certification, before the
    /// call returns.
    pub fn set_after_certify_hook(&self, hook: Option<MockHook>) {
        self.hooks.lock().after_certify = hook;
    }

    /// Installs a hook run at the start of `commit_order_enter`.
    pub fn set_before_commit_order_enter_hook(&self, hook: Option<MockHook>) {
        self.hooks.lock().before_commit_order_enter = hook;
    }

    /// Queues a write-set for the next `run_applier` call.
    pub fn queue_apply(&self, handle: WsHandle, meta: WsMeta, data: Vec<u8>) {
        self.state
            .lock()
            .pending_applies
            .push_back((handle, meta, data));
    }

    /// Builds applier metadata for a foreign write-set at `seqno`.
    pub fn foreign_meta(&self, trx: TransactionId, seqno: Seqno, flags: WsFlags) -> WsMeta {
        WsMeta::new(
            Gtid::new(self.group_id, seqno),
            Stid::new(Id::random(), trx, ClientId::new(1)),
            Seqno::new(seqno.get() - 1),
            flags,
        )
    }

    /// Returns how many times the handle of `trx` was released.
    pub fn release_count(&self, trx: TransactionId) -> usize {
        self.state.lock().releases.get(&trx).copied().unwrap_or(0)
    }

    /// Returns the total number of release calls.
    pub fn total_releases(&self) -> usize {
        self.state.lock().releases.values().sum()
    }

    /// Returns the number of `replay` calls.
    pub fn replay_count(&self) -> usize {
        self.state.lock().replays
    }

    /// Returns the number of `certify` calls.
    pub fn certify_count(&self) -> usize {
        self.state.lock().certify_calls
    }

    /// Returns the number of `commit_order_enter` calls.
    pub fn commit_order_enter_count(&self) -> usize {
        self.state.lock().commit_order_enters
    }

    /// Returns the number of `commit_order_leave` calls.
    pub fn commit_order_leave_count(&self) -> usize {
        self.state.lock().commit_order_leaves
    }

    /// Returns true if `start_transaction` registered `trx`.
    pub fn was_started(&self, trx: TransactionId) -> bool {
        self.state.lock().started.contains(&trx)
    }

    /// Returns true if `trx` is currently marked as BF-aborted.
    pub fn is_aborted(&self, trx: TransactionId) -> bool {
        self.state.lock().aborted.contains(&trx)
    }

    /// Returns the keys appended for `trx`.
    pub fn keys(&self, trx: TransactionId) -> Vec<Key> {
        self.state.lock().keys.get(&trx).cloned().unwrap_or_default()
    }

    /// Returns the data appended for `trx`.
    pub fn data(&self, trx: TransactionId) -> Vec<u8> {
        self.state.lock().data.get(&trx).cloned().unwrap_or_default()
    }

    /// Returns recorded `sst_sent` calls.
    pub fn sst_sent_calls(&self) -> Vec<(Gtid, i32)> {
        self.state.lock().sst_sent.clone()
    }

    /// Returns recorded `sst_received` calls.
    pub fn sst_received_calls(&self) -> Vec<(Gtid, i32)> {
        self.state.lock().sst_received.clone()
    }

    fn assigned_meta(
        &self,
        seqno: Seqno,
        client_id: ClientId,
        handle: &WsHandle,
        flags: WsFlags,
    ) -> WsMeta {
        WsMeta::new(
            Gtid::new(self.group_id, seqno),
            Stid::new(self.server_id, handle.transaction_id, client_id),
            Seqno::new(seqno.get() - 1),
            flags,
        )
    }

    fn run_hook(hook: Option<MockHook>) {
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("server_id", &self.server_id)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

impl ReplicationProvider for MockProvider {
    fn connect(&self, _cluster_name: &str, _address: &str, _bootstrap: bool) -> ProviderResult<()> {
        self.state.lock().connected = true;
        Ok(())
    }

    fn disconnect(&self) -> ProviderResult<()> {
        self.state.lock().connected = false;
        Ok(())
    }

    fn run_applier(&self, target: &dyn ApplyTarget) -> ReplResult<()> {
        loop {
            let next = self.state.lock().pending_applies.pop_front();
            match next {
                Some((handle, meta, data)) => target.apply(&handle, &meta, &data)?,
                None => return Ok(()),
            }
        }
    }

    fn start_transaction(&self, handle: &WsHandle) -> ProviderResult<()> {
        self.state.lock().started.insert(handle.transaction_id);
        Ok(())
    }

    fn append_key(&self, handle: &WsHandle, key: &Key) -> ProviderResult<()> {
        self.state
            .lock()
            .keys
            .entry(handle.transaction_id)
            .or_default()
            .push(key.clone());
        Ok(())
    }

    fn append_data(&self, handle: &WsHandle, data: &[u8]) -> ProviderResult<()> {
        self.state
            .lock()
            .data
            .entry(handle.transaction_id)
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn certify(
        &self,
        client_id: ClientId,
        handle: &WsHandle,
        flags: WsFlags,
        meta: &mut WsMeta,
    ) -> ProviderResult<()> {
        {
            let mut state = self.state.lock();
            state.certify_calls += 1;
            if state.aborted.contains(&handle.transaction_id) {
                return Err(ProviderError::BfAbort);
            }
            if let Some(err) = state.certify_result {
                if let Some(seqno) = state.failed_certify_seqno {
                    *meta = self.assigned_meta(seqno, client_id, handle, flags);
                }
                return Err(err);
            }
            let seqno = match state.certify_seqno.take() {
                Some(seqno) => seqno,
                None => Seqno::new(state.next_seqno),
            };
            state.next_seqno = state.next_seqno.max(seqno.get() + 1);
            *meta = self.assigned_meta(seqno, client_id, handle, flags);
            state.ordered.insert(handle.transaction_id, *meta);
        }
        let hook = self.hooks.lock().after_certify.clone();
        Self::run_hook(hook);
        Ok(())
    }

    fn bf_abort(&self, aborter: Seqno, victim: TransactionId) -> ProviderResult<Seqno> {
        let mut state = self.state.lock();
        if let Some(err) = state.bf_abort_result {
            return Err(err);
        }
        let victim_seqno = state
            .ordered
            .get(&victim)
            .map(|meta| meta.seqno())
            .unwrap_or(Seqno::UNDEFINED);
        if !victim_seqno.is_undefined() && victim_seqno < aborter {
            return Err(ProviderError::NotAllowed);
        }
        state.aborted.insert(victim);
        Ok(victim_seqno)
    }

    fn commit_order_enter(&self, handle: &WsHandle, _meta: &WsMeta) -> ProviderResult<()> {
        let hook = self.hooks.lock().before_commit_order_enter.clone();
        Self::run_hook(hook);
        let mut state = self.state.lock();
        state.commit_order_enters += 1;
        if state.aborted.contains(&handle.transaction_id) {
            return Err(ProviderError::BfAbort);
        }
        match state.commit_order_enter_result {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn commit_order_leave(&self, _handle: &WsHandle, _meta: &WsMeta) -> ProviderResult<()> {
        self.state.lock().commit_order_leaves += 1;
        Ok(())
    }

    fn release(&self, handle: &WsHandle) -> ProviderResult<()> {
        let mut state = self.state.lock();
        *state.releases.entry(handle.transaction_id).or_insert(0) += 1;
        state.aborted.remove(&handle.transaction_id);
        match state.release_result {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn replay(&self, handle: &WsHandle, target: &dyn ApplyTarget) -> ReplResult<()> {
        let (meta, data) = {
            let mut state = self.state.lock();
            state.replays += 1;
            state.aborted.remove(&handle.transaction_id);
            let meta = state
                .ordered
                .get(&handle.transaction_id)
                .copied()
                .ok_or(ReplError::Provider(ProviderError::TransactionMissing))?;
            let data = state
                .data
                .get(&handle.transaction_id)
                .cloned()
                .unwrap_or_default();
            (meta, data)
        };
        target.apply(handle, &meta, &data)
    }

    fn sst_sent(&self, gtid: &Gtid, error: i32) -> ProviderResult<()> {
        self.state.lock().sst_sent.push((*gtid, error));
        Ok(())
    }

    fn sst_received(&self, gtid: &Gtid, error: i32) -> ProviderResult<()> {
        self.state.lock().sst_received.push((*gtid, error));
        Ok(())
    }

    fn status(&self) -> Vec<StatusVariable> {
        let state = self.state.lock();
        vec![
            StatusVariable::new("connected", state.connected),
            StatusVariable::new("last_seqno", state.next_seqno - 1),
            StatusVariable::new("certify_calls", state.certify_calls),
            StatusVariable::new("replays", state.replays),
        ]
    }
}
