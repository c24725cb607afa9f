//! Client connection state.
//!
//! A [`ClientState`] drives exactly one transaction at a time through the
//! command and statement boundaries of a database connection. It owns the
//! mutex/condition pair that serializes the connection's own thread with
//! asynchronous brute-force aborters and the background rollback worker.
//!
//! ## Locking
//!
//! Every operation takes the connection lock to check and move state,
//! drops it around provider and storage calls, and re-validates the state
//! after taking it back. Only [`ClientState::bf_abort`] keeps the lock
//! across a provider call.

mod abort;
mod commit;
mod storage;

pub use storage::{MemoryStorage, StorageTransaction};

use crate::error::{ClientError, ReplError, ReplResult};
use crate::server::NodeContext;
use crate::transaction::{Transaction, TransactionState};
use crate::types::{ClientId, Gtid};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Replication role of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// Transactions are not replicated.
    Local,
    /// Transactions are certified and replicated.
    Replicating,
    /// Applies write-sets delivered by the provider.
    Applier,
    /// Total order isolation executor.
    HighPriority,
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientMode::Local => "local",
            ClientMode::Replicating => "replicating",
            ClientMode::Applier => "applier",
            ClientMode::HighPriority => "high_priority",
        };
        f.write_str(s)
    }
}

/// Command-processing phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Not opened yet, or cleaned up.
    None,
    /// Waiting for the next command.
    Idle,
    /// Executing a command.
    Exec,
    /// Sending a command result.
    Result,
    /// Closing.
    Quitting,
}

impl ClientPhase {
    fn can_transition_to(self, next: ClientPhase) -> bool {
        use ClientPhase::*;
        matches!(
            (self, next),
            (None, Idle) | (Idle, Exec | Quitting) | (Exec, Result) | (Result, Idle) | (Quitting, None)
        )
    }
}

impl fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientPhase::None => "none",
            ClientPhase::Idle => "idle",
            ClientPhase::Exec => "exec",
            ClientPhase::Result => "result",
            ClientPhase::Quitting => "quitting",
        };
        f.write_str(s)
    }
}

/// State guarded by the connection lock.
pub(crate) struct ClientInner {
    pub(crate) mode: ClientMode,
    pub(crate) phase: ClientPhase,
    pub(crate) current_error: ClientError,
    pub(crate) transaction: Transaction,
    /// Set while the connection replays its own transaction.
    pub(crate) replaying: bool,
    /// Set after a fatal error; the connection refuses further commands.
    pub(crate) aborted: bool,
    /// Set while the rollback worker owns an aborting transaction.
    pub(crate) background_rollback: bool,
    pub(crate) last_written_gtid: Gtid,
}

/// A client connection participating in replication.
pub struct ClientState {
    id: ClientId,
    node: Arc<NodeContext>,
    storage: Arc<dyn StorageTransaction>,
    me: Weak<ClientState>,
    inner: Mutex<ClientInner>,
    cond: Condvar,
    killed: AtomicBool,
    debug_log_level: AtomicU32,
}

impl ClientState {
    pub(crate) fn new(
        id: ClientId,
        mode: ClientMode,
        node: Arc<NodeContext>,
        storage: Arc<dyn StorageTransaction>,
    ) -> Arc<Self> {
        let debug_log_level = node.debug_log_level;
        Arc::new_cyclic(|me| Self {
            id,
            node,
            storage,
            me: me.clone(),
            inner: Mutex::new(ClientInner {
                mode,
                phase: ClientPhase::None,
                current_error: ClientError::Success,
                transaction: Transaction::new(),
                replaying: false,
                aborted: false,
                background_rollback: false,
                last_written_gtid: Gtid::UNDEFINED,
            }),
            cond: Condvar::new(),
            killed: AtomicBool::new(false),
            debug_log_level: AtomicU32::new(debug_log_level),
        })
    }

    /// Returns the connection id.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Returns the replication mode.
    pub fn mode(&self) -> ClientMode {
        self.inner.lock().mode
    }

    /// Returns the command phase.
    pub fn phase(&self) -> ClientPhase {
        self.inner.lock().phase
    }

    /// Returns a copy of the current transaction.
    pub fn transaction(&self) -> Transaction {
        self.inner.lock().transaction.clone()
    }

    /// Returns the current transaction state.
    pub fn transaction_state(&self) -> TransactionState {
        self.inner.lock().transaction.state()
    }

    /// Returns the storage callbacks of this connection.
    pub fn storage(&self) -> &Arc<dyn StorageTransaction> {
        &self.storage
    }

    /// Returns the error recorded for the current statement.
    pub fn current_error(&self) -> ClientError {
        self.inner.lock().current_error
    }

    /// Records an error for the current statement.
    pub fn override_error(&self, error: ClientError) {
        self.inner.lock().current_error = error;
    }

    /// Clears the recorded error.
    pub fn reset_error(&self) {
        self.inner.lock().current_error = ClientError::Success;
    }

    /// Returns the GTID of the last transaction this connection committed.
    pub fn last_written_gtid(&self) -> Gtid {
        self.inner.lock().last_written_gtid
    }

    /// Interrupts the connection; an in-flight certification fails.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    /// Returns true if the connection was interrupted.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Returns the debug log level.
    pub fn debug_log_level(&self) -> u32 {
        self.debug_log_level.load(Ordering::Relaxed)
    }

    /// Sets the debug log level; state traces are logged at level 1 and up.
    pub fn set_debug_log_level(&self, level: u32) {
        self.debug_log_level.store(level, Ordering::Relaxed);
    }

    /// Returns true if the connection stopped after a fatal error.
    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    /// Opens the connection.
    pub fn open(&self) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        self.set_phase(&mut inner, ClientPhase::Idle)
    }

    /// Closes the connection, rolling back any open transaction.
    pub fn close(&self) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        self.debug_log_state(&inner, "close: enter");
        self.set_phase(&mut inner, ClientPhase::Quitting)?;
        self.wait_for_background_rollback(&mut inner);
        if inner.transaction.active() {
            drop(inner);
            if self.transaction_state() != TransactionState::Aborted {
                self.rollback()?;
            }
            if let Err(err) = self.after_statement() {
                if err.is_fatal() {
                    return Err(err);
                }
            }
            inner = self.inner.lock();
        }
        self.debug_log_state(&inner, "close: leave");
        Ok(())
    }

    /// Releases the connection after [`ClientState::close`].
    pub fn cleanup(&self) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        self.set_phase(&mut inner, ClientPhase::None)
    }

    /// Marks the connection as stopped by a fatal error.
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.aborted = true;
        tracing::error!(client_id = self.id.as_u64(), "connection aborted");
    }

    /// Command boundary: a new command starts.
    ///
    /// Fails with a deadlock error if the open transaction was BF-aborted
    /// while the connection was idle; the transaction is cleaned up first.
    pub fn before_command(&self) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        self.debug_log_state(&inner, "before_command: enter");
        if inner.aborted {
            return Err(ReplError::fatal("connection was aborted"));
        }
        self.wait_for_background_rollback(&mut inner);
        self.set_phase(&mut inner, ClientPhase::Exec)?;
        inner.current_error = ClientError::Success;

        if inner.transaction.active() {
            match inner.transaction.state() {
                TransactionState::MustAbort => {
                    inner.current_error = ClientError::Deadlock;
                    drop(inner);
                    self.rollback()?;
                    self.finish_aborted_statement()?;
                    return Err(ReplError::Aborted(ClientError::Deadlock));
                }
                TransactionState::Aborted => {
                    inner.current_error = ClientError::Deadlock;
                    drop(inner);
                    self.finish_aborted_statement()?;
                    return Err(ReplError::Aborted(ClientError::Deadlock));
                }
                _ => {}
            }
        }
        self.debug_log_state(&inner, "before_command: success");
        Ok(())
    }

    /// Statement boundary: a new statement starts.
    pub fn before_statement(&self) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        if inner.transaction.active() && inner.transaction.state() == TransactionState::MustAbort {
            inner.current_error = ClientError::Deadlock;
            return Err(ReplError::Aborted(ClientError::Deadlock));
        }
        Ok(())
    }

    /// Command boundary: the result is about to be sent.
    pub fn after_command_before_result(&self) -> ReplResult<()> {
        if self.must_abort() {
            self.override_error(ClientError::Deadlock);
            self.rollback()?;
            self.finish_aborted_statement()?;
        }
        let mut inner = self.lock();
        self.set_phase(&mut inner, ClientPhase::Result)
    }

    /// Command boundary: the result was sent.
    pub fn after_command_after_result(&self) -> ReplResult<()> {
        if self.must_abort() {
            self.rollback()?;
            self.finish_aborted_statement()?;
            self.override_error(ClientError::Deadlock);
        }
        let mut inner = self.lock();
        self.set_phase(&mut inner, ClientPhase::Idle)?;
        self.debug_log_state(&inner, "after_command_after_result");
        Ok(())
    }

    /// Streaming replication is not supported.
    pub fn enable_streaming(&self) -> ReplResult<()> {
        Err(ReplError::unimplemented("streaming replication"))
    }

    /// Adopting a transaction from another connection is not supported.
    pub fn adopt_transaction(&self, _transaction: &Transaction) -> ReplResult<()> {
        Err(ReplError::unimplemented("transaction adoption"))
    }

    /// Total order isolation is not supported.
    pub fn enter_toi(&self) -> ReplResult<()> {
        Err(ReplError::unimplemented("total order isolation"))
    }

    /// Blocks until the rollback worker is done with this connection.
    /// Returns true if it had to wait.
    pub(crate) fn wait_for_background_rollback(
        &self,
        inner: &mut MutexGuard<'_, ClientInner>,
    ) -> bool {
        let mut waited = false;
        while inner.background_rollback {
            self.cond.wait(inner);
            waited = true;
        }
        waited
    }

    fn must_abort(&self) -> bool {
        let inner = self.lock();
        inner.transaction.active() && inner.transaction.state() == TransactionState::MustAbort
    }

    /// Runs `after_statement` for a transaction that already rolled back,
    /// keeping only fatal failures.
    fn finish_aborted_statement(&self) -> ReplResult<()> {
        match self.after_statement() {
            Err(err) if err.is_fatal() => Err(err),
            _ => Ok(()),
        }
    }

    fn set_phase(&self, inner: &mut ClientInner, next: ClientPhase) -> ReplResult<()> {
        if !inner.phase.can_transition_to(next) {
            return Err(ReplError::invalid_operation(format!(
                "client phase {} -> {} not allowed",
                inner.phase, next
            )));
        }
        inner.phase = next;
        Ok(())
    }

    fn set_state(&self, inner: &mut ClientInner, next: TransactionState) -> ReplResult<()> {
        let result = inner.transaction.set_state(next);
        if let Err(err) = &result {
            tracing::error!(
                client_id = self.id.as_u64(),
                trx_id = inner.transaction.id().as_u64(),
                history = ?inner.transaction.history(),
                "{err}"
            );
        }
        result
    }

    fn debug_log_state(&self, inner: &ClientInner, context: &str) {
        if self.debug_log_level() >= 1 {
            debug!(
                client_id = self.id.as_u64(),
                trx_id = inner.transaction.id().as_u64(),
                seqno = inner.transaction.seqno().get(),
                state = %inner.transaction.state(),
                mode = %inner.mode,
                phase = %inner.phase,
                error = %inner.current_error,
                "{context}"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock()
    }

    fn shared(&self) -> Option<Arc<ClientState>> {
        self.me.upgrade()
    }
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ClientState")
            .field("id", &self.id)
            .field("mode", &inner.mode)
            .field("phase", &inner.phase)
            .field("transaction", &inner.transaction.id())
            .field("state", &inner.transaction.state())
            .finish_non_exhaustive()
    }
}
