//! Replication provider abstraction.
//!
//! The provider is the group-communication and certification service the
//! core consumes. It is shared by every connection of a node; thread safety
//! of concurrent calls is the provider's contract.
//!
//! Every call may block on the network. The core never holds a connection
//! lock across a provider call except for [`ReplicationProvider::bf_abort`],
//! which must therefore never call back into a connection.

mod mock;

pub use mock::{MockHook, MockProvider};

use crate::error::{ProviderResult, ReplResult};
use crate::types::{ClientId, Gtid, Key, Seqno, TransactionId, View, WsFlags, WsHandle, WsMeta};

/// A diagnostic key/value pair reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusVariable {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl StatusVariable {
    /// Creates a new status variable.
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

/// Receiver of write-sets and membership events delivered by the provider.
///
/// Implemented by applier connections (for the replicated stream) and by
/// replaying connections (for [`ReplicationProvider::replay`]).
pub trait ApplyTarget: Send + Sync {
    /// Applies one write-set.
    fn apply(&self, handle: &WsHandle, meta: &WsMeta, data: &[u8]) -> ReplResult<()>;

    /// Called when cluster membership changes.
    fn on_view(&self, _view: &View) -> ReplResult<()> {
        Ok(())
    }

    /// Called when the node has caught up with the group.
    fn on_sync(&self) -> ReplResult<()> {
        Ok(())
    }
}

/// Interface to the group-communication/certification service.
pub trait ReplicationProvider: Send + Sync {
    /// Joins the cluster.
    fn connect(&self, cluster_name: &str, address: &str, bootstrap: bool) -> ProviderResult<()>;

    /// Leaves the cluster. Unblocks [`ReplicationProvider::run_applier`].
    fn disconnect(&self) -> ProviderResult<()>;

    /// Receives the replicated stream and drives it into `target` until
    /// the node disconnects.
    fn run_applier(&self, target: &dyn ApplyTarget) -> ReplResult<()>;

    /// Registers a write-set placeholder for a new local transaction.
    fn start_transaction(&self, handle: &WsHandle) -> ProviderResult<()>;

    /// Appends a certification key to the write-set.
    fn append_key(&self, handle: &WsHandle, key: &Key) -> ProviderResult<()>;

    /// Appends payload to the write-set.
    fn append_data(&self, handle: &WsHandle, data: &[u8]) -> ProviderResult<()>;

    /// Submits the write-set for global ordering and certification.
    ///
    /// On success `meta` carries the assigned seqno and dependency.
    fn certify(
        &self,
        client_id: ClientId,
        handle: &WsHandle,
        flags: WsFlags,
        meta: &mut WsMeta,
    ) -> ProviderResult<()>;

    /// Marks `victim` for abort on behalf of the write-set at `aborter`.
    ///
    /// Returns the victim's seqno if it had already been ordered, or
    /// [`Seqno::UNDEFINED`].
    fn bf_abort(&self, aborter: Seqno, victim: TransactionId) -> ProviderResult<Seqno>;

    /// Enters the commit-order critical section for `meta`'s seqno.
    fn commit_order_enter(&self, handle: &WsHandle, meta: &WsMeta) -> ProviderResult<()>;

    /// Leaves the commit-order critical section.
    fn commit_order_leave(&self, handle: &WsHandle, meta: &WsMeta) -> ProviderResult<()>;

    /// Frees provider bookkeeping for the handle.
    fn release(&self, handle: &WsHandle) -> ProviderResult<()>;

    /// Re-applies a certified write-set through `target`.
    fn replay(&self, handle: &WsHandle, target: &dyn ApplyTarget) -> ReplResult<()>;

    /// Reports the outcome of a state transfer this node donated.
    fn sst_sent(&self, gtid: &Gtid, error: i32) -> ProviderResult<()>;

    /// Reports the outcome of a state transfer this node received.
    fn sst_received(&self, gtid: &Gtid, error: i32) -> ProviderResult<()>;

    /// Returns a diagnostic snapshot.
    fn status(&self) -> Vec<StatusVariable>;
}
