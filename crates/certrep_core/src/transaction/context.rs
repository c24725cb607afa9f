//! Per-connection transaction record.

use super::state::TransactionState;
use crate::client::ClientPhase;
use crate::error::{ReplError, ReplResult};
use crate::types::{Seqno, TransactionId, WsFlags, WsHandle, WsMeta};

/// The transaction currently owned by a connection.
///
/// A transaction is never shared between connections. All mutation goes
/// through the owning connection's lock; see [`crate::ClientState`].
#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    state_hist: Vec<TransactionState>,
    ws_handle: WsHandle,
    ws_meta: WsMeta,
    flags: WsFlags,
    certified: bool,
    bf_abort_state: TransactionState,
    bf_abort_client_state: Option<ClientPhase>,
    /// Provider holds bookkeeping for `ws_handle` that must be released.
    registered: bool,
    released: bool,
}

impl Transaction {
    /// Creates an inactive transaction.
    pub(crate) fn new() -> Self {
        Self {
            id: TransactionId::UNDEFINED,
            state: TransactionState::Executing,
            state_hist: Vec::new(),
            ws_handle: WsHandle::default(),
            ws_meta: WsMeta::default(),
            flags: WsFlags::NONE,
            certified: false,
            bf_abort_state: TransactionState::Executing,
            bf_abort_client_state: None,
            registered: false,
            released: false,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns prior states, oldest first. Diagnostic only.
    #[must_use]
    pub fn history(&self) -> &[TransactionState] {
        &self.state_hist
    }

    /// Returns the write-set handle.
    #[must_use]
    pub fn ws_handle(&self) -> &WsHandle {
        &self.ws_handle
    }

    /// Returns the replication metadata.
    #[must_use]
    pub fn ws_meta(&self) -> &WsMeta {
        &self.ws_meta
    }

    /// Returns the write-set flags.
    #[must_use]
    pub fn flags(&self) -> WsFlags {
        self.flags
    }

    /// Returns the assigned seqno (undefined until ordered).
    #[must_use]
    pub fn seqno(&self) -> Seqno {
        self.ws_meta.seqno()
    }

    /// Returns true while a transaction is open on the connection.
    #[must_use]
    pub fn active(&self) -> bool {
        !self.id.is_undefined()
    }

    /// Returns true once the provider has assigned a seqno.
    #[must_use]
    pub fn ordered(&self) -> bool {
        !self.ws_meta.seqno().is_undefined()
    }

    /// Returns true once certification succeeded.
    #[must_use]
    pub fn certified(&self) -> bool {
        self.certified
    }

    /// Returns true if the write-set was marked unsafe for parallel apply.
    #[must_use]
    pub fn pa_unsafe(&self) -> bool {
        self.flags.contains(WsFlags::PA_UNSAFE)
    }

    /// State the transaction was in when the last BF-abort landed.
    #[must_use]
    pub fn bf_abort_state(&self) -> TransactionState {
        self.bf_abort_state
    }

    /// Connection phase at the moment the last BF-abort landed.
    #[must_use]
    pub fn bf_abort_client_state(&self) -> Option<ClientPhase> {
        self.bf_abort_client_state
    }

    /// Moves to `next`, rejecting transitions outside the legality table.
    ///
    /// The `committing -> committing` self-loop is accepted but leaves no
    /// trace in the history.
    pub(crate) fn set_state(&mut self, next: TransactionState) -> ReplResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ReplError::illegal_transition(self.state, next));
        }
        if next != self.state {
            self.state_hist.push(self.state);
            self.state = next;
        }
        Ok(())
    }

    /// Opens a local transaction.
    pub(crate) fn start(&mut self, id: TransactionId, registered: bool) {
        self.id = id;
        self.state = TransactionState::Executing;
        self.state_hist.clear();
        self.ws_handle = WsHandle::new(id);
        self.ws_meta = WsMeta::default();
        self.flags = WsFlags::START_TRANSACTION;
        self.certified = false;
        self.registered = registered;
        self.released = false;
    }

    /// Adopts a write-set delivered by the provider for applying.
    pub(crate) fn start_applying(&mut self, handle: WsHandle, meta: WsMeta) {
        self.id = meta.transaction_id();
        self.state = TransactionState::Executing;
        self.state_hist.clear();
        self.ws_handle = handle;
        self.ws_meta = meta;
        self.flags = meta.flags;
        self.certified = true;
        self.registered = false;
        self.released = false;
    }

    /// Stores metadata assigned by the provider.
    pub(crate) fn set_ws_meta(&mut self, meta: WsMeta) {
        self.ws_meta = meta;
    }

    /// Adds write-set flags.
    pub(crate) fn add_flags(&mut self, flags: WsFlags) {
        self.flags |= flags;
    }

    /// Records that the provider now holds bookkeeping for the handle.
    pub(crate) fn set_registered(&mut self) {
        self.registered = true;
    }

    /// Records a successful certification.
    pub(crate) fn set_certified(&mut self) {
        self.certified = true;
    }

    /// Records the states observed when a BF-abort lands.
    pub(crate) fn record_bf_abort(&mut self, client_phase: ClientPhase) {
        self.bf_abort_state = self.state;
        self.bf_abort_client_state = Some(client_phase);
    }

    /// Claims the single provider release of this lifecycle.
    ///
    /// Returns `Ok(false)` when the provider holds nothing for the handle,
    /// `Ok(true)` when the caller must call `release`, and an error when
    /// the handle was already released.
    pub(crate) fn claim_release(&mut self) -> ReplResult<bool> {
        if !self.registered {
            return Ok(false);
        }
        if self.released {
            return Err(ReplError::DoubleRelease(self.id));
        }
        self.released = true;
        Ok(true)
    }

    /// Resets the transaction after commit, abort or replay completion.
    ///
    /// The state and its history are kept for troubleshooting until the
    /// next start. Safe to call on an already cleaned-up transaction.
    pub(crate) fn cleanup(&mut self) {
        self.id = TransactionId::UNDEFINED;
        self.ws_handle = WsHandle::default();
        self.ws_meta = WsMeta::default();
        self.flags = WsFlags::NONE;
        self.certified = false;
        self.bf_abort_state = TransactionState::Executing;
        self.bf_abort_client_state = None;
        self.registered = false;
        self.released = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Gtid, Id, Stid};

    #[test]
    fn new_transaction_is_inactive() {
        let trx = Transaction::new();
        assert!(!trx.active());
        assert!(!trx.ordered());
        assert!(!trx.certified());
    }

    #[test]
    fn start_resets_history() {
        let mut trx = Transaction::new();
        trx.start(TransactionId::new(7), true);
        trx.set_state(TransactionState::MustAbort).unwrap();
        trx.start(TransactionId::new(8), true);
        assert_eq!(trx.state(), TransactionState::Executing);
        assert!(trx.history().is_empty());
        assert!(trx.flags().starts_transaction());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut trx = Transaction::new();
        trx.start(TransactionId::new(1), false);
        let err = trx.set_state(TransactionState::Committed).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(trx.state(), TransactionState::Executing);
    }

    #[test]
    fn self_loop_leaves_no_history() {
        let mut trx = Transaction::new();
        trx.start(TransactionId::new(1), false);
        trx.set_state(TransactionState::Preparing).unwrap();
        trx.set_state(TransactionState::Certifying).unwrap();
        trx.set_state(TransactionState::Committing).unwrap();
        trx.set_state(TransactionState::Committing).unwrap();
        assert_eq!(
            trx.history(),
            &[
                TransactionState::Executing,
                TransactionState::Preparing,
                TransactionState::Certifying
            ]
        );
    }

    #[test]
    fn release_claimed_once() {
        let mut trx = Transaction::new();
        trx.start(TransactionId::new(1), true);
        assert!(trx.claim_release().unwrap());
        assert!(matches!(
            trx.claim_release(),
            Err(ReplError::DoubleRelease(_))
        ));

        trx.start(TransactionId::new(2), false);
        assert!(!trx.claim_release().unwrap());
    }

    #[test]
    fn applying_is_pre_certified() {
        let mut trx = Transaction::new();
        let meta = WsMeta::new(
            Gtid::new(Id::random(), Seqno::new(4)),
            Stid::new(Id::random(), TransactionId::new(9), Default::default()),
            Seqno::new(3),
            WsFlags::START_TRANSACTION | WsFlags::COMMIT,
        );
        trx.start_applying(WsHandle::new(TransactionId::new(9)), meta);
        assert!(trx.active());
        assert!(trx.certified());
        assert!(trx.ordered());
        assert_eq!(trx.seqno(), Seqno::new(4));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut trx = Transaction::new();
        trx.start(TransactionId::new(3), true);
        trx.cleanup();
        trx.cleanup();
        assert!(!trx.active());
        assert_eq!(trx.ws_handle(), &WsHandle::default());
        assert_eq!(trx.ws_meta(), &WsMeta::default());
        assert!(!trx.certified());
    }
}
