//! Rollback, brute-force abort and replay.

use super::{ClientInner, ClientMode, ClientPhase, ClientState};
use crate::config::RollbackMode;
use crate::error::{ClientError, ReplError, ReplResult};
use crate::provider::ApplyTarget;
use crate::transaction::TransactionState;
use crate::types::{Seqno, WsHandle, WsMeta};
use parking_lot::MutexGuard;
use tracing::{debug, error, info, warn};

impl ClientState {
    /// Rollback starts.
    ///
    /// A certified transaction that was BF-aborted goes to must_replay
    /// instead of aborting; its storage changes are still undone.
    pub fn before_rollback(&self) -> ReplResult<()> {
        let mut inner = self.lock();
        self.debug_log_state(&inner, "before_rollback: enter");
        match inner.transaction.state() {
            TransactionState::Executing
            | TransactionState::Preparing
            | TransactionState::Committing => {
                self.set_state(&mut inner, TransactionState::MustAbort)?;
                self.abort_or_replay(&mut inner)
            }
            TransactionState::MustAbort => self.abort_or_replay(&mut inner),
            TransactionState::CertFailed => {
                self.set_state(&mut inner, TransactionState::Aborting)
            }
            TransactionState::Aborting if inner.background_rollback => {
                Err(ReplError::invalid_operation(
                    "rollback is owned by the background worker",
                ))
            }
            TransactionState::MustReplay | TransactionState::Aborting => Ok(()),
            other => Err(ReplError::illegal_transition(
                other,
                TransactionState::Aborting,
            )),
        }
    }

    /// Rollback finished.
    pub fn after_rollback(&self) -> ReplResult<()> {
        let mut inner = self.lock();
        self.debug_log_state(&inner, "after_rollback: enter");
        match inner.transaction.state() {
            TransactionState::Aborting => {
                self.set_state(&mut inner, TransactionState::Aborted)?;
                self.node.stats.record_rollback();
                self.cond.notify_all();
                Ok(())
            }
            TransactionState::MustReplay => Ok(()),
            other => Err(ReplError::illegal_transition(
                other,
                TransactionState::Aborted,
            )),
        }
    }

    /// Runs `before_rollback`, the storage rollback and `after_rollback`.
    ///
    /// If the rollback worker owns the transaction, waits for it instead.
    pub fn rollback(&self) -> ReplResult<()> {
        {
            let mut inner = self.lock();
            if self.wait_for_background_rollback(&mut inner)
                && inner.transaction.state() == TransactionState::Aborted
            {
                return Ok(());
            }
        }
        self.before_rollback()?;
        self.storage.rollback(self)?;
        self.after_rollback()
    }

    /// Statement boundary: finishes whatever the statement left behind.
    ///
    /// Committed and aborted transactions are cleaned up, aborted ones
    /// roll back first and must_replay ones are replayed. Returns the
    /// statement error, if any, as [`ReplError::Aborted`].
    pub fn after_statement(&self) -> ReplResult<()> {
        let mut inner = self.lock();
        self.wait_for_background_rollback(&mut inner);
        self.debug_log_state(&inner, "after_statement: enter");
        if !inner.transaction.active() {
            return statement_result(&inner);
        }

        match inner.transaction.state() {
            TransactionState::Executing => return statement_result(&inner),
            TransactionState::Committed
            | TransactionState::Aborted
            | TransactionState::MustReplay => {}
            TransactionState::MustAbort | TransactionState::CertFailed => {
                inner.current_error = ClientError::Deadlock;
                drop(inner);
                self.rollback()?;
                inner = self.lock();
            }
            other => {
                return Err(ReplError::invalid_operation(format!(
                    "statement ended with transaction in state {other}"
                )))
            }
        }

        let mut released = Ok(());
        if inner.transaction.state() == TransactionState::MustReplay {
            self.replay(&mut inner)?;
            released = self.release_handle(&mut inner);
        }

        match inner.transaction.state() {
            TransactionState::Committed => {}
            TransactionState::Aborted => released = self.release_handle(&mut inner),
            other => {
                return Err(ReplError::illegal_transition(
                    other,
                    TransactionState::Committed,
                ))
            }
        }
        inner.transaction.cleanup();
        self.debug_log_state(&inner, "after_statement: leave");
        released?;
        statement_result(&inner)
    }

    /// Marks this connection's transaction for abort on behalf of the
    /// write-set ordered at `aborter`.
    ///
    /// Called from another thread. Returns true if the abort was accepted.
    /// A victim ordered strictly before the aborter cannot be aborted.
    pub fn bf_abort(&self, aborter: Seqno) -> bool {
        let mut inner = self.lock();
        let trx = &inner.transaction;
        if !trx.active() || !matches!(inner.mode, ClientMode::Local | ClientMode::Replicating) {
            return false;
        }
        if trx.ordered() && trx.seqno() < aborter {
            debug!(
                client_id = self.id.as_u64(),
                victim_seqno = trx.seqno().get(),
                aborter = aborter.get(),
                "bf_abort rejected: victim ordered before aborter"
            );
            return false;
        }
        if !trx.state().accepts_bf_abort() {
            return false;
        }
        if inner.mode == ClientMode::Local
            && matches!(
                trx.state(),
                TransactionState::Certifying | TransactionState::Committing
            )
            && self.node.order_local_commits
        {
            // Holds or is being given a seqno; there is no write-set to replay.
            return false;
        }

        let victim = trx.id();
        match self.node.provider.bf_abort(aborter, victim) {
            Ok(victim_seqno) => {
                let phase = inner.phase;
                inner.transaction.record_bf_abort(phase);
                if let Err(err) = self.set_state(&mut inner, TransactionState::MustAbort) {
                    error!(client_id = self.id.as_u64(), "bf_abort: {err}");
                    return false;
                }
                self.node.stats.record_bf_abort();
                debug!(
                    client_id = self.id.as_u64(),
                    trx_id = victim.as_u64(),
                    victim_seqno = victim_seqno.get(),
                    aborter = aborter.get(),
                    phase = %phase,
                    "bf_abort accepted"
                );
                if phase == ClientPhase::Idle
                    && self.node.rollback_mode == RollbackMode::Sync
                    && !inner.transaction.certified()
                {
                    self.schedule_background_rollback(&mut inner);
                }
                true
            }
            Err(err) => {
                debug!(
                    client_id = self.id.as_u64(),
                    trx_id = victim.as_u64(),
                    "bf_abort refused by provider: {err}"
                );
                false
            }
        }
    }

    /// Completes the rollback of an idle victim on the rollback worker.
    pub(crate) fn background_rollback(&self) -> ReplResult<()> {
        {
            let mut inner = self.lock();
            if !inner.background_rollback {
                return Ok(());
            }
            if inner.transaction.state() != TransactionState::Aborting {
                inner.background_rollback = false;
                self.cond.notify_all();
                return Ok(());
            }
        }
        let result = self
            .storage
            .rollback(self)
            .and_then(|()| self.after_rollback());
        let mut inner = self.lock();
        inner.background_rollback = false;
        self.cond.notify_all();
        result
    }

    fn schedule_background_rollback(&self, inner: &mut ClientInner) {
        let Some(me) = self.shared() else {
            return;
        };
        if !self.node.rollbacker.is_running() {
            warn!(
                client_id = self.id.as_u64(),
                "rollback worker stopped, victim rolls back on next command"
            );
            return;
        }
        if let Err(err) = self.set_state(inner, TransactionState::Aborting) {
            error!(client_id = self.id.as_u64(), "background rollback: {err}");
            return;
        }
        inner.background_rollback = true;
        if !self.node.rollbacker.submit(me) {
            inner.background_rollback = false;
            error!(
                client_id = self.id.as_u64(),
                "failed to queue background rollback"
            );
        }
    }

    /// Moves a must_abort transaction on: replay if certified, else abort.
    fn abort_or_replay(&self, inner: &mut ClientInner) -> ReplResult<()> {
        if inner.transaction.certified() {
            self.set_state(inner, TransactionState::MustReplay)
        } else {
            self.set_state(inner, TransactionState::Aborting)
        }
    }

    /// Re-applies a certified transaction that lost a conflict locally.
    ///
    /// Runs in applier mode; the provider drives the write-set back
    /// through [`ReplayTarget`]. A failed replay stops the connection.
    fn replay(&self, inner: &mut MutexGuard<'_, ClientInner>) -> ReplResult<()> {
        self.set_state(inner, TransactionState::Replaying)?;
        let handle = *inner.transaction.ws_handle();
        let previous_mode = inner.mode;
        inner.mode = ClientMode::Applier;
        inner.replaying = true;
        info!(
            client_id = self.id.as_u64(),
            trx_id = handle.transaction_id.as_u64(),
            seqno = inner.transaction.seqno().get(),
            "replaying"
        );

        let result = MutexGuard::unlocked(inner, || {
            self.node.replayers.enter();
            let result = self
                .node
                .provider
                .replay(&handle, &ReplayTarget { client: self });
            self.node.replayers.leave();
            result
        });
        inner.mode = previous_mode;
        inner.replaying = false;

        if let Err(err) = result {
            inner.aborted = true;
            return Err(ReplError::fatal(format!(
                "replay of {} failed: {err}",
                handle.transaction_id
            )));
        }
        if inner.transaction.state() != TransactionState::Committed {
            inner.aborted = true;
            return Err(ReplError::fatal(format!(
                "replay of {} ended in state {}",
                handle.transaction_id,
                inner.transaction.state()
            )));
        }
        self.node.stats.record_replay();
        inner.current_error = ClientError::Success;
        Ok(())
    }

    fn apply_replayed(&self, meta: &WsMeta, data: &[u8]) -> ReplResult<()> {
        self.start_replaying(*meta)?;
        self.storage.apply(self, meta, data)?;
        self.commit()
    }

    /// Releases provider resources once per transaction lifecycle.
    ///
    /// A failed release is not retried; the handle counts as released.
    pub(crate) fn release_handle(&self, inner: &mut MutexGuard<'_, ClientInner>) -> ReplResult<()> {
        if !inner.transaction.claim_release()? {
            return Ok(());
        }
        let handle = *inner.transaction.ws_handle();
        let result = MutexGuard::unlocked(inner, || self.node.provider.release(&handle));
        result.map_err(|err| {
            warn!(
                client_id = self.id.as_u64(),
                trx_id = handle.transaction_id.as_u64(),
                "release failed: {err}"
            );
            ReplError::Provider(err)
        })
    }
}

fn statement_result(inner: &ClientInner) -> ReplResult<()> {
    if inner.current_error.is_error() {
        Err(ReplError::Aborted(inner.current_error))
    } else {
        Ok(())
    }
}

/// Feeds a replayed write-set back into its own connection.
struct ReplayTarget<'a> {
    client: &'a ClientState,
}

impl ApplyTarget for ReplayTarget<'_> {
    fn apply(&self, _handle: &WsHandle, meta: &WsMeta, data: &[u8]) -> ReplResult<()> {
        self.client.apply_replayed(meta, data)
    }
}
