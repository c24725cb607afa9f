//! Transaction start, write-set building and the commit path.

use super::{ClientInner, ClientMode, ClientState};
use crate::error::{ClientError, ProviderError, ReplError, ReplResult};
use crate::transaction::TransactionState;
use crate::types::{Key, TransactionId, WsFlags, WsHandle, WsMeta};
use parking_lot::MutexGuard;
use tracing::{debug, warn};

impl ClientState {
    /// Opens a transaction with the next node-wide transaction id.
    pub fn begin(&self) -> ReplResult<TransactionId> {
        let id = self.node.next_transaction_id();
        self.start_transaction(id)?;
        Ok(id)
    }

    /// Opens a local transaction.
    ///
    /// Replicating connections register the write-set with the provider.
    pub fn start_transaction(&self, id: TransactionId) -> ReplResult<()> {
        if id.is_undefined() {
            return Err(ReplError::invalid_operation("undefined transaction id"));
        }
        let mut inner = self.lock();
        if inner.transaction.active() {
            return Err(ReplError::invalid_operation(format!(
                "{} already active",
                inner.transaction.id()
            )));
        }
        let mode = inner.mode;
        match mode {
            ClientMode::Local => inner.transaction.start(id, false),
            ClientMode::Replicating => inner.transaction.start(id, true),
            ClientMode::Applier | ClientMode::HighPriority => {
                return Err(ReplError::invalid_operation(format!(
                    "{mode} connection cannot start a local transaction"
                )));
            }
        }
        self.node.stats.record_start();
        self.debug_log_state(&inner, "start_transaction");

        if mode == ClientMode::Replicating {
            let handle = *inner.transaction.ws_handle();
            let result =
                MutexGuard::unlocked(&mut inner, || self.node.provider.start_transaction(&handle));
            if let Err(err) = result {
                warn!(client_id = self.id.as_u64(), "start_transaction: {err}");
                self.force_must_abort(&mut inner)?;
                inner.current_error = ClientError::ErrorDuringCommit;
                return Err(ReplError::Aborted(ClientError::ErrorDuringCommit));
            }
        }
        drop(inner);
        self.storage.start(self)
    }

    /// Adopts a write-set delivered by the provider on an applier
    /// connection.
    pub fn start_applying(&self, handle: WsHandle, meta: WsMeta) -> ReplResult<()> {
        let mut inner = self.lock();
        if !matches!(inner.mode, ClientMode::Applier | ClientMode::HighPriority) {
            return Err(ReplError::invalid_operation(format!(
                "{} connection cannot apply write-sets",
                inner.mode
            )));
        }
        if inner.transaction.active() {
            return Err(ReplError::invalid_operation(format!(
                "{} still active",
                inner.transaction.id()
            )));
        }
        inner.transaction.start_applying(handle, meta);
        self.debug_log_state(&inner, "start_applying");
        Ok(())
    }

    /// Refreshes the metadata of a transaction being replayed.
    pub fn start_replaying(&self, meta: WsMeta) -> ReplResult<()> {
        let mut inner = self.lock();
        if inner.transaction.state() != TransactionState::Replaying {
            return Err(ReplError::invalid_operation(format!(
                "start_replaying in state {}",
                inner.transaction.state()
            )));
        }
        inner.transaction.set_ws_meta(meta);
        Ok(())
    }

    /// Appends a certification key to the write-set.
    ///
    /// Only replicating connections build a write-set; on other
    /// connections this does nothing.
    pub fn append_key(&self, key: &Key) -> ReplResult<()> {
        if let Some(handle) = self.replicated_handle()? {
            self.node.provider.append_key(&handle, key)?;
        }
        Ok(())
    }

    /// Appends payload to the write-set. Does nothing on connections that
    /// do not replicate.
    pub fn append_data(&self, data: &[u8]) -> ReplResult<()> {
        if let Some(handle) = self.replicated_handle()? {
            self.node.provider.append_data(&handle, data)?;
        }
        Ok(())
    }

    /// Two-phase commit: the prepare phase starts.
    pub fn before_prepare(&self) -> ReplResult<()> {
        let mut inner = self.lock();
        self.debug_log_state(&inner, "before_prepare: enter");
        if inner.transaction.state() == TransactionState::MustAbort {
            inner.current_error = ClientError::Deadlock;
            return Err(ReplError::Aborted(ClientError::Deadlock));
        }
        self.set_state(&mut inner, TransactionState::Preparing)
    }

    /// Two-phase commit: the prepare phase finished.
    ///
    /// Replicating connections certify here; the others move straight on
    /// to committing.
    pub fn after_prepare(&self) -> ReplResult<()> {
        let mut inner = self.lock();
        self.debug_log_state(&inner, "after_prepare: enter");
        if inner.transaction.state() == TransactionState::MustAbort {
            inner.current_error = ClientError::Deadlock;
            return Err(ReplError::Aborted(ClientError::Deadlock));
        }
        match inner.mode {
            ClientMode::Replicating => self.certify_commit(&mut inner),
            ClientMode::Local if self.node.order_local_commits => {
                self.order_local_commit(&mut inner)
            }
            _ => {
                self.set_state(&mut inner, TransactionState::Certifying)?;
                self.set_state(&mut inner, TransactionState::Committing)
            }
        }
    }

    /// Commit starts: certifies (one-phase) and enters the commit order.
    pub fn before_commit(&self) -> ReplResult<()> {
        let mut inner = self.lock();
        self.debug_log_state(&inner, "before_commit: enter");
        match inner.mode {
            ClientMode::Replicating => self.before_commit_replicating(&mut inner),
            ClientMode::Local => {
                if self.node.order_local_commits
                    && inner.transaction.state() == TransactionState::Executing
                {
                    self.order_local_commit(&mut inner)?;
                }
                self.walk_to_committing(&mut inner)?;
                if inner.transaction.ordered() {
                    self.enter_commit_order_or_fail(&mut inner)?;
                }
                Ok(())
            }
            ClientMode::Applier | ClientMode::HighPriority => {
                self.walk_to_committing(&mut inner)?;
                self.enter_commit_order_or_fail(&mut inner)
            }
        }
    }

    /// Storage commit is done: leaves the commit order.
    pub fn ordered_commit(&self) -> ReplResult<()> {
        let mut inner = self.lock();
        self.debug_log_state(&inner, "ordered_commit: enter");
        let state = inner.transaction.state();
        if state != TransactionState::Committing {
            return Err(ReplError::illegal_transition(
                state,
                TransactionState::OrderedCommit,
            ));
        }
        let leave = match inner.mode {
            ClientMode::Local => inner.transaction.ordered(),
            _ => true,
        };
        if leave {
            let handle = *inner.transaction.ws_handle();
            let meta = *inner.transaction.ws_meta();
            let result = MutexGuard::unlocked(&mut inner, || {
                self.node.provider.commit_order_leave(&handle, &meta)
            });
            if let Err(err) = result {
                inner.aborted = true;
                return Err(ReplError::fatal(format!(
                    "commit_order_leave failed for {}: {err}",
                    inner.transaction.id()
                )));
            }
        }
        self.set_state(&mut inner, TransactionState::OrderedCommit)
    }

    /// Commit finished: releases provider resources.
    ///
    /// The transaction is committed even if the release fails; the
    /// release error is returned.
    pub fn after_commit(&self) -> ReplResult<()> {
        let mut inner = self.lock();
        self.debug_log_state(&inner, "after_commit: enter");
        let state = inner.transaction.state();
        if state != TransactionState::OrderedCommit {
            return Err(ReplError::illegal_transition(
                state,
                TransactionState::Committed,
            ));
        }
        let released = match inner.mode {
            ClientMode::Replicating | ClientMode::Local => {
                self.node.stats.record_commit();
                self.release_handle(&mut inner)
            }
            ClientMode::Applier | ClientMode::HighPriority => {
                if !inner.replaying {
                    self.node.stats.record_applied();
                }
                Ok(())
            }
        };
        if inner.transaction.ordered() {
            inner.last_written_gtid = inner.transaction.ws_meta().gtid;
        }
        self.set_state(&mut inner, TransactionState::Committed)?;
        released
    }

    /// Runs the whole commit sequence: `before_commit`, storage commit,
    /// `ordered_commit` and `after_commit`.
    ///
    /// A recoverable failure before ordering rolls back the storage
    /// changes; a transaction left in must_replay is replayed by
    /// `after_statement`, which the caller still owes.
    pub fn commit(&self) -> ReplResult<()> {
        if let Err(err) = self.before_commit() {
            if !err.is_fatal() {
                self.rollback()?;
            }
            return Err(err);
        }
        self.storage.commit(self).map_err(|err| {
            self.abort();
            ReplError::fatal(format!("storage commit failed after ordering: {err}"))
        })?;
        self.ordered_commit()?;
        self.after_commit()
    }

    fn replicated_handle(&self) -> ReplResult<Option<WsHandle>> {
        let inner = self.lock();
        if !inner.transaction.active() {
            return Err(ReplError::invalid_operation("no active transaction"));
        }
        if inner.mode != ClientMode::Replicating {
            return Ok(None);
        }
        Ok(Some(*inner.transaction.ws_handle()))
    }

    fn before_commit_replicating(&self, inner: &mut MutexGuard<'_, ClientInner>) -> ReplResult<()> {
        match inner.transaction.state() {
            TransactionState::Executing => self.certify_commit(inner)?,
            TransactionState::Committing => {}
            TransactionState::MustAbort => {
                if inner.transaction.certified() {
                    self.set_state(inner, TransactionState::MustReplay)?;
                }
                inner.current_error = ClientError::Deadlock;
                return Err(ReplError::Aborted(ClientError::Deadlock));
            }
            other => {
                return Err(ReplError::illegal_transition(
                    other,
                    TransactionState::Committing,
                ))
            }
        }

        let handle = *inner.transaction.ws_handle();
        let meta = *inner.transaction.ws_meta();
        let result = MutexGuard::unlocked(inner, || {
            self.node.provider.commit_order_enter(&handle, &meta)
        });
        match result {
            Ok(()) => {
                self.debug_log_state(inner, "before_commit: in commit order");
                Ok(())
            }
            Err(ProviderError::BfAbort) => {
                self.force_must_abort(inner)?;
                self.set_state(inner, TransactionState::MustReplay)?;
                inner.current_error = ClientError::Deadlock;
                Err(ReplError::Aborted(ClientError::Deadlock))
            }
            Err(err) => {
                inner.aborted = true;
                Err(ReplError::fatal(format!(
                    "commit_order_enter failed for {}: {err}",
                    inner.transaction.id()
                )))
            }
        }
    }

    /// Moves a non-replicating transaction to committing along the table.
    fn walk_to_committing(&self, inner: &mut MutexGuard<'_, ClientInner>) -> ReplResult<()> {
        match inner.transaction.state() {
            TransactionState::Executing => {
                self.set_state(inner, TransactionState::Preparing)?;
                self.set_state(inner, TransactionState::Certifying)?;
                self.set_state(inner, TransactionState::Committing)
            }
            TransactionState::Replaying | TransactionState::Committing => {
                self.set_state(inner, TransactionState::Committing)
            }
            TransactionState::MustAbort => {
                inner.current_error = ClientError::Deadlock;
                Err(ReplError::Aborted(ClientError::Deadlock))
            }
            other => Err(ReplError::illegal_transition(
                other,
                TransactionState::Committing,
            )),
        }
    }

    /// Gets a seqno for a local transaction so that it commits in the
    /// global order. The write-set is empty, so nothing conflicts with it.
    fn order_local_commit(&self, inner: &mut MutexGuard<'_, ClientInner>) -> ReplResult<()> {
        if inner.transaction.state() == TransactionState::MustAbort {
            inner.current_error = ClientError::Deadlock;
            return Err(ReplError::Aborted(ClientError::Deadlock));
        }
        if inner.transaction.state() == TransactionState::Executing {
            self.set_state(inner, TransactionState::Preparing)?;
        }
        self.set_state(inner, TransactionState::Certifying)?;
        inner.transaction.add_flags(WsFlags::COMMIT);

        let handle = *inner.transaction.ws_handle();
        let started =
            MutexGuard::unlocked(inner, || self.node.provider.start_transaction(&handle));
        let ordered = match started {
            Ok(()) => {
                inner.transaction.set_registered();
                let flags = inner.transaction.flags();
                let mut meta = *inner.transaction.ws_meta();
                MutexGuard::unlocked(inner, || {
                    self.node.provider.certify(self.id, &handle, flags, &mut meta)
                })
                .map(|()| meta)
            }
            Err(err) => Err(err),
        };
        match ordered {
            Ok(meta) => {
                inner.transaction.set_ws_meta(meta);
                inner.transaction.set_certified();
                self.debug_log_state(inner, "order_local_commit: ordered");
                self.set_state(inner, TransactionState::Committing)
            }
            Err(err) => {
                warn!(
                    client_id = self.id.as_u64(),
                    trx_id = inner.transaction.id().as_u64(),
                    "ordering local commit failed: {err}"
                );
                self.force_must_abort(inner)?;
                inner.current_error = ClientError::ErrorDuringCommit;
                Err(ReplError::Aborted(ClientError::ErrorDuringCommit))
            }
        }
    }

    /// Enters the commit order where losing it cannot be recovered.
    fn enter_commit_order_or_fail(
        &self,
        inner: &mut MutexGuard<'_, ClientInner>,
    ) -> ReplResult<()> {
        let handle = *inner.transaction.ws_handle();
        let meta = *inner.transaction.ws_meta();
        let result = MutexGuard::unlocked(inner, || {
            self.node.provider.commit_order_enter(&handle, &meta)
        });
        result.map_err(|err| {
            inner.aborted = true;
            ReplError::fatal(format!(
                "commit_order_enter failed for {} at {}: {err}",
                inner.transaction.id(),
                meta.seqno()
            ))
        })
    }

    /// Replicates the write-set and maps the certification outcome onto
    /// the transaction state.
    pub(crate) fn certify_commit(&self, inner: &mut MutexGuard<'_, ClientInner>) -> ReplResult<()> {
        self.wait_for_replayers(inner);

        if inner.transaction.state() == TransactionState::MustAbort {
            inner.current_error = ClientError::Deadlock;
            return Err(ReplError::Aborted(ClientError::Deadlock));
        }
        if inner.transaction.state() == TransactionState::Executing {
            self.set_state(inner, TransactionState::Preparing)?;
        }
        self.set_state(inner, TransactionState::Certifying)?;
        inner.transaction.add_flags(WsFlags::COMMIT);

        let prepared =
            MutexGuard::unlocked(inner, || self.storage.prepare_data_for_replication(self));
        if let Err(err) = prepared {
            warn!(
                client_id = self.id.as_u64(),
                trx_id = inner.transaction.id().as_u64(),
                "prepare_data_for_replication failed: {err}"
            );
            self.force_must_abort(inner)?;
            inner.current_error = ClientError::ErrorDuringCommit;
            return Err(ReplError::Aborted(ClientError::ErrorDuringCommit));
        }

        if self.killed() {
            self.force_must_abort(inner)?;
            inner.current_error = ClientError::Interrupted;
            return Err(ReplError::Aborted(ClientError::Interrupted));
        }

        let handle = *inner.transaction.ws_handle();
        let flags = inner.transaction.flags();
        let mut meta = *inner.transaction.ws_meta();
        let certified = MutexGuard::unlocked(inner, || {
            self.node
                .provider
                .certify(self.id, &handle, flags, &mut meta)
        });
        if matches!(certified, Ok(()) | Err(ProviderError::BfAbort)) {
            inner.transaction.set_ws_meta(meta);
        }
        self.debug_log_state(inner, "certify_commit: certified");

        match certified {
            Ok(()) => {
                inner.transaction.set_certified();
                match inner.transaction.state() {
                    TransactionState::Certifying => {
                        self.set_state(inner, TransactionState::Committing)
                    }
                    TransactionState::MustAbort => {
                        debug!(
                            client_id = self.id.as_u64(),
                            seqno = meta.seqno().get(),
                            "aborted after certification, will replay"
                        );
                        self.set_state(inner, TransactionState::MustReplay)?;
                        inner.current_error = ClientError::Deadlock;
                        Err(ReplError::Aborted(ClientError::Deadlock))
                    }
                    other => Err(ReplError::illegal_transition(
                        other,
                        TransactionState::Committing,
                    )),
                }
            }
            Err(err) => self.certification_failed(inner, err),
        }
    }

    fn certification_failed(
        &self,
        inner: &mut MutexGuard<'_, ClientInner>,
        err: ProviderError,
    ) -> ReplResult<()> {
        debug!(
            client_id = self.id.as_u64(),
            trx_id = inner.transaction.id().as_u64(),
            "certification: {err}"
        );
        let class = match err {
            ProviderError::Warning
            | ProviderError::TransactionMissing
            | ProviderError::NotImplemented
            | ProviderError::NotAllowed => {
                self.force_must_abort(inner)?;
                ClientError::ErrorDuringCommit
            }
            ProviderError::SizeExceeded => {
                self.force_must_abort(inner)?;
                ClientError::SizeExceeded
            }
            ProviderError::CertificationFailed => {
                if inner.transaction.state() != TransactionState::MustAbort {
                    self.set_state(inner, TransactionState::CertFailed)?;
                }
                self.node.stats.record_cert_failure();
                ClientError::Deadlock
            }
            ProviderError::BfAbort => {
                self.force_must_abort(inner)?;
                if inner.transaction.ordered() {
                    inner.transaction.set_certified();
                    self.set_state(inner, TransactionState::MustReplay)?;
                }
                ClientError::Deadlock
            }
            ProviderError::ConnectionFailed | ProviderError::ProviderFailed => {
                if inner.transaction.state() == TransactionState::MustAbort {
                    ClientError::Deadlock
                } else {
                    self.set_state(inner, TransactionState::MustAbort)?;
                    ClientError::ErrorDuringCommit
                }
            }
            ProviderError::Fatal => {
                self.force_must_abort(inner)?;
                inner.current_error = ClientError::ErrorDuringCommit;
                inner.aborted = true;
                return Err(ReplError::fatal(format!(
                    "provider failure while certifying {}",
                    inner.transaction.id()
                )));
            }
        };
        inner.current_error = class;
        Err(ReplError::Aborted(class))
    }

    /// Moves to must_abort unless already there.
    pub(crate) fn force_must_abort(&self, inner: &mut ClientInner) -> ReplResult<()> {
        if inner.transaction.state() != TransactionState::MustAbort {
            self.set_state(inner, TransactionState::MustAbort)?;
        }
        Ok(())
    }

    fn wait_for_replayers(&self, inner: &mut MutexGuard<'_, ClientInner>) {
        if self.node.replayers.active() == 0 {
            return;
        }
        MutexGuard::unlocked(inner, || self.node.replayers.wait_idle());
    }
}
