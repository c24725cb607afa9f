//! Per-node loopback provider.

use crate::group::{Event, LoopbackGroup, NodeQueue, Submission};
use certrep_core::{
    ApplyTarget, ClientId, Gtid, Id, Key, ProviderError, ProviderResult, ReplError, ReplResult,
    ReplicationProvider, Seqno, StatusVariable, TransactionId, WsFlags, WsHandle, WsMeta,
};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct HandleState {
    keys: Vec<Key>,
    data: Vec<u8>,
    last_seen: i64,
    meta: Option<WsMeta>,
    aborted: bool,
    in_commit_order: bool,
}

struct NodeInner {
    connected: bool,
    handles: HashMap<TransactionId, HandleState>,
    /// Last seqno that left the commit order on this node.
    last_left: i64,
}

/// A node's view of a [`LoopbackGroup`].
///
/// Holds the write-sets of local transactions until they are released and
/// runs the node's commit-order monitor.
pub struct LoopbackProvider {
    id: Id,
    name: String,
    group: Arc<LoopbackGroup>,
    queue: Arc<NodeQueue>,
    inner: Mutex<NodeInner>,
    monitor: Condvar,
}

impl LoopbackProvider {
    /// Creates a provider for the node `id` in `group`.
    pub fn new(group: Arc<LoopbackGroup>, id: Id, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            group,
            queue: Arc::new(NodeQueue::default()),
            inner: Mutex::new(NodeInner {
                connected: false,
                handles: HashMap::new(),
                last_left: 0,
            }),
            monitor: Condvar::new(),
        }
    }

    /// Returns the node id.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the last seqno committed on this node.
    pub fn last_committed(&self) -> Seqno {
        Seqno::new(self.inner.lock().last_left)
    }

    /// Returns the number of handles not yet released.
    pub fn open_handles(&self) -> usize {
        self.inner.lock().handles.len()
    }

    /// Applier write-sets carry the origin's transaction ids, which may
    /// collide with local ones.
    fn is_local(&self, meta: &WsMeta) -> bool {
        meta.stid.server_id == self.id
    }

    fn with_handle<T>(
        &self,
        handle: &WsHandle,
        f: impl FnOnce(&mut HandleState) -> ProviderResult<T>,
    ) -> ProviderResult<T> {
        let mut inner = self.inner.lock();
        match inner.handles.get_mut(&handle.transaction_id) {
            Some(state) => f(state),
            None => Err(ProviderError::TransactionMissing),
        }
    }
}

impl ReplicationProvider for LoopbackProvider {
    fn connect(&self, cluster_name: &str, _address: &str, bootstrap: bool) -> ProviderResult<()> {
        if cluster_name != self.group.config().cluster_name {
            warn!(
                node = %self.name,
                cluster_name,
                expected = %self.group.config().cluster_name,
                "cluster name mismatch"
            );
            return Err(ProviderError::ConnectionFailed);
        }
        if !bootstrap && self.group.member_count() == 0 {
            return Err(ProviderError::ConnectionFailed);
        }
        self.group
            .join(self.id, &self.name, Arc::clone(&self.queue), |position| {
                let mut inner = self.inner.lock();
                inner.connected = true;
                inner.last_left = position;
            })
    }

    fn disconnect(&self) -> ProviderResult<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.connected {
                return Ok(());
            }
            inner.connected = false;
        }
        self.group.leave(self.id);
        self.monitor.notify_all();
        Ok(())
    }

    fn run_applier(&self, target: &dyn ApplyTarget) -> ReplResult<()> {
        loop {
            match self.queue.pop() {
                Event::WriteSet { handle, meta, data } => target.apply(&handle, &meta, &data)?,
                Event::View(view) => target.on_view(&view)?,
                Event::Sync => target.on_sync()?,
                Event::Shutdown => {
                    debug!(node = %self.name, "applier shutdown");
                    return Ok(());
                }
            }
        }
    }

    fn start_transaction(&self, handle: &WsHandle) -> ProviderResult<()> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(ProviderError::ConnectionFailed);
        }
        let last_seen = inner.last_left;
        inner.handles.insert(
            handle.transaction_id,
            HandleState {
                last_seen,
                ..HandleState::default()
            },
        );
        Ok(())
    }

    fn append_key(&self, handle: &WsHandle, key: &Key) -> ProviderResult<()> {
        self.with_handle(handle, |state| {
            state.keys.push(key.clone());
            Ok(())
        })
    }

    fn append_data(&self, handle: &WsHandle, data: &[u8]) -> ProviderResult<()> {
        let max = self.group.config().max_ws_size;
        self.with_handle(handle, |state| {
            if state.data.len() + data.len() > max {
                return Err(ProviderError::SizeExceeded);
            }
            state.data.extend_from_slice(data);
            Ok(())
        })
    }

    fn certify(
        &self,
        client_id: ClientId,
        handle: &WsHandle,
        flags: WsFlags,
        meta: &mut WsMeta,
    ) -> ProviderResult<()> {
        let (keys, data, last_seen) = self.with_handle(handle, |state| {
            if state.aborted {
                return Err(ProviderError::BfAbort);
            }
            Ok((state.keys.clone(), state.data.clone(), state.last_seen))
        })?;

        let certified = self.group.certify(Submission {
            source: self.id,
            client_id,
            handle: *handle,
            flags,
            keys: &keys,
            data: Arc::new(data),
            last_seen,
        })?;

        let mut inner = self.inner.lock();
        if let Some(state) = inner.handles.get_mut(&handle.transaction_id) {
            state.meta = Some(certified);
        }
        *meta = certified;
        Ok(())
    }

    fn bf_abort(&self, aborter: Seqno, victim: TransactionId) -> ProviderResult<Seqno> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.handles.get_mut(&victim) else {
            return Ok(Seqno::UNDEFINED);
        };
        let victim_seqno = state.meta.map(|m| m.seqno()).unwrap_or(Seqno::UNDEFINED);
        if !victim_seqno.is_undefined() && victim_seqno < aborter {
            return Err(ProviderError::NotAllowed);
        }
        if state.in_commit_order {
            return Err(ProviderError::NotAllowed);
        }
        state.aborted = true;
        drop(inner);
        self.monitor.notify_all();
        Ok(victim_seqno)
    }

    fn commit_order_enter(&self, handle: &WsHandle, meta: &WsMeta) -> ProviderResult<()> {
        let seqno = meta.seqno().get();
        let deadline = Instant::now() + self.group.config().commit_order_timeout;
        let local = self.is_local(meta);
        let mut inner = self.inner.lock();
        loop {
            if local
                && inner
                    .handles
                    .get(&handle.transaction_id)
                    .is_some_and(|state| state.aborted)
            {
                return Err(ProviderError::BfAbort);
            }
            if inner.last_left >= seqno {
                return Err(ProviderError::ProviderFailed);
            }
            if inner.last_left + 1 == seqno {
                if local {
                    if let Some(state) = inner.handles.get_mut(&handle.transaction_id) {
                        state.in_commit_order = true;
                    }
                }
                return Ok(());
            }
            if !inner.connected {
                return Err(ProviderError::ConnectionFailed);
            }
            if self.monitor.wait_until(&mut inner, deadline).timed_out() {
                warn!(
                    node = %self.name,
                    seqno,
                    last_left = inner.last_left,
                    "commit order wait timed out"
                );
                return Err(ProviderError::ProviderFailed);
            }
        }
    }

    fn commit_order_leave(&self, handle: &WsHandle, meta: &WsMeta) -> ProviderResult<()> {
        let seqno = meta.seqno().get();
        let mut inner = self.inner.lock();
        if inner.last_left + 1 != seqno {
            return Err(ProviderError::ProviderFailed);
        }
        inner.last_left = seqno;
        if self.is_local(meta) {
            if let Some(state) = inner.handles.get_mut(&handle.transaction_id) {
                state.in_commit_order = false;
            }
        }
        drop(inner);
        self.monitor.notify_all();
        Ok(())
    }

    fn release(&self, handle: &WsHandle) -> ProviderResult<()> {
        self.inner.lock().handles.remove(&handle.transaction_id);
        Ok(())
    }

    fn replay(&self, handle: &WsHandle, target: &dyn ApplyTarget) -> ReplResult<()> {
        let (meta, data) = self
            .with_handle(handle, |state| {
                let meta = state.meta.ok_or(ProviderError::TransactionMissing)?;
                state.aborted = false;
                Ok((meta, state.data.clone()))
            })
            .map_err(ReplError::from)?;
        debug!(
            node = %self.name,
            trx_id = handle.transaction_id.as_u64(),
            seqno = meta.seqno().get(),
            "replaying write-set"
        );
        target.apply(handle, &meta, &data)
    }

    fn sst_sent(&self, gtid: &Gtid, error: i32) -> ProviderResult<()> {
        debug!(node = %self.name, %gtid, error, "state transfer sent");
        Ok(())
    }

    fn sst_received(&self, gtid: &Gtid, error: i32) -> ProviderResult<()> {
        debug!(node = %self.name, %gtid, error, "state transfer received");
        Ok(())
    }

    fn status(&self) -> Vec<StatusVariable> {
        // The group lock is taken before the node lock in `connect`.
        let group_last_seqno = self.group.last_seqno();
        let cert_index_size = self.group.index_size();
        let inner = self.inner.lock();
        vec![
            StatusVariable::new("node_name", &self.name),
            StatusVariable::new("connected", inner.connected),
            StatusVariable::new("last_committed", inner.last_left),
            StatusVariable::new("open_handles", inner.handles.len()),
            StatusVariable::new("group_last_seqno", group_last_seqno),
            StatusVariable::new("cert_index_size", cert_index_size),
            StatusVariable::new("recv_queue", self.queue.len()),
        ]
    }
}

impl std::fmt::Debug for LoopbackProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackProvider")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
