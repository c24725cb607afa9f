//! The shared half of the loopback provider: ordering, certification and
//! delivery.

use crate::config::LoopbackConfig;
use certrep_core::{
    ClientId, Gtid, Id, Key, KeyType, Member, ProviderError, Seqno, Stid, View, ViewStatus,
    WsFlags, WsHandle, WsMeta,
};
use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// An event delivered to a node's applier.
#[derive(Debug, Clone)]
pub(crate) enum Event {
    WriteSet {
        handle: WsHandle,
        meta: WsMeta,
        data: Arc<Vec<u8>>,
    },
    View(View),
    Sync,
    Shutdown,
}

/// FIFO of events for one node.
#[derive(Default)]
pub(crate) struct NodeQueue {
    events: Mutex<VecDeque<Event>>,
    cond: Condvar,
}

impl NodeQueue {
    pub(crate) fn push(&self, event: Event) {
        self.events.lock().push_back(event);
        self.cond.notify_one();
    }

    pub(crate) fn pop(&self) -> Event {
        let mut events = self.events.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return event;
            }
            self.cond.wait(&mut events);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.events.lock().len()
    }
}

/// Write-set submitted for certification.
pub(crate) struct Submission<'a> {
    pub(crate) source: Id,
    pub(crate) client_id: ClientId,
    pub(crate) handle: WsHandle,
    pub(crate) flags: WsFlags,
    pub(crate) keys: &'a [Key],
    pub(crate) data: Arc<Vec<u8>>,
    pub(crate) last_seen: i64,
}

/// Last seqnos that touched a key, split by access strength.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    shared: i64,
    write: i64,
    source: Id,
}

impl IndexEntry {
    /// Newest seqno an access of `key_type` conflicts with.
    fn conflicting_seqno(&self, key_type: KeyType) -> i64 {
        if key_type.conflicts_with(KeyType::Shared) {
            self.shared.max(self.write)
        } else {
            self.write
        }
    }
}

struct MemberSlot {
    id: Id,
    name: String,
    queue: Arc<NodeQueue>,
}

struct GroupInner {
    last_seqno: i64,
    view_seqno: i64,
    index: HashMap<[u8; 32], IndexEntry>,
    members: Vec<MemberSlot>,
}

/// A replication group living inside one process.
///
/// Every node of the group holds an `Arc` to the same instance. Write-sets
/// are totally ordered by a single counter and certified against an index
/// of the keys written so far.
pub struct LoopbackGroup {
    id: Id,
    config: LoopbackConfig,
    inner: Mutex<GroupInner>,
}

impl LoopbackGroup {
    /// Creates an empty group.
    pub fn new(config: LoopbackConfig) -> Arc<Self> {
        Arc::new(Self {
            id: Id::random(),
            config,
            inner: Mutex::new(GroupInner {
                last_seqno: 0,
                view_seqno: 0,
                index: HashMap::new(),
                members: Vec::new(),
            }),
        })
    }

    /// Returns the group id used in GTIDs.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Returns the last assigned seqno.
    pub fn last_seqno(&self) -> Seqno {
        Seqno::new(self.inner.lock().last_seqno)
    }

    /// Returns the number of connected members.
    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Returns the number of keys in the certification index.
    pub fn index_size(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Adds a member and returns the seqno it joins at.
    ///
    /// `on_join` runs under the group lock so that no write-set can be
    /// ordered between the join position and the caller's bookkeeping.
    pub(crate) fn join(
        &self,
        id: Id,
        name: &str,
        queue: Arc<NodeQueue>,
        on_join: impl FnOnce(i64),
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        if inner.members.iter().any(|m| m.id == id) {
            return Err(ProviderError::NotAllowed);
        }
        inner.members.push(MemberSlot {
            id,
            name: name.to_string(),
            queue: Arc::clone(&queue),
        });
        on_join(inner.last_seqno);
        self.deliver_view(&mut inner);
        queue.push(Event::Sync);
        info!(group = %self.id, member = name, members = inner.members.len(), "member joined");
        Ok(())
    }

    /// Removes a member and stops its applier.
    pub(crate) fn leave(&self, id: Id) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.members.iter().position(|m| m.id == id) else {
            return;
        };
        let slot = inner.members.remove(pos);
        slot.queue.push(Event::Shutdown);
        if inner.members.is_empty() {
            inner.index.clear();
        } else {
            self.deliver_view(&mut inner);
        }
        info!(group = %self.id, member = %slot.name, "member left");
    }

    /// Orders and certifies a write-set.
    ///
    /// On success the write-set is queued to every other member in seqno
    /// order. A failed write-set is not assigned a seqno.
    pub(crate) fn certify(&self, ws: Submission<'_>) -> Result<WsMeta, ProviderError> {
        let digests: Vec<([u8; 32], KeyType)> = ws
            .keys
            .iter()
            .map(|key| (key_digest(key), key.key_type()))
            .collect();

        let mut inner = self.inner.lock();
        if !inner.members.iter().any(|m| m.id == ws.source) {
            return Err(ProviderError::ConnectionFailed);
        }
        for (digest, key_type) in &digests {
            if let Some(entry) = inner.index.get(digest) {
                let conflicting = entry.conflicting_seqno(*key_type);
                if conflicting > ws.last_seen {
                    debug!(
                        trx_id = ws.handle.transaction_id.as_u64(),
                        last_seen = ws.last_seen,
                        conflicting_seqno = conflicting,
                        conflicting_source = %entry.source,
                        "certification conflict"
                    );
                    return Err(ProviderError::CertificationFailed);
                }
            }
        }

        inner.last_seqno += 1;
        let seqno = inner.last_seqno;
        for (digest, key_type) in digests {
            let entry = inner.index.entry(digest).or_insert(IndexEntry {
                shared: 0,
                write: 0,
                source: ws.source,
            });
            if key_type == KeyType::Shared {
                entry.shared = seqno;
            } else {
                entry.write = seqno;
            }
            entry.source = ws.source;
        }

        let meta = WsMeta::new(
            Gtid::new(self.id, Seqno::new(seqno)),
            Stid::new(ws.source, ws.handle.transaction_id, ws.client_id),
            Seqno::new(seqno - 1),
            ws.flags,
        );
        for member in inner.members.iter().filter(|m| m.id != ws.source) {
            member.queue.push(Event::WriteSet {
                handle: ws.handle,
                meta,
                data: Arc::clone(&ws.data),
            });
        }
        Ok(meta)
    }

    fn deliver_view(&self, inner: &mut GroupInner) {
        inner.view_seqno += 1;
        let members: Vec<Member> = inner
            .members
            .iter()
            .map(|m| Member {
                id: m.id,
                name: m.name.clone(),
                incoming: format!("loopback://{}", m.name),
            })
            .collect();
        for (own_index, slot) in inner.members.iter().enumerate() {
            slot.queue.push(Event::View(View {
                state_id: Gtid::new(self.id, Seqno::new(inner.last_seqno)),
                view_seqno: Seqno::new(inner.view_seqno),
                status: ViewStatus::Primary,
                members: members.clone(),
                own_index: Some(own_index),
            }));
        }
    }
}

impl std::fmt::Debug for LoopbackGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackGroup")
            .field("id", &self.id)
            .field("cluster_name", &self.config.cluster_name)
            .finish_non_exhaustive()
    }
}

/// Digest of a key's parts; part boundaries are length-prefixed.
fn key_digest(key: &Key) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in key.parts() {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}
