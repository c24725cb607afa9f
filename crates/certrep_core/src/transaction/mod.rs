//! Transaction replication state machine.
//!
//! A replicated transaction moves through certification, ordered commit,
//! brute-force abort and replay. The legal moves are fixed by
//! [`TransactionState::can_transition_to`]; anything else is a protocol
//! violation and surfaces as a fatal [`crate::ReplError`].
//!
//! The operations that drive the machine live on [`crate::ClientState`]
//! because they share the connection's lock with asynchronous aborters.

mod context;
mod state;

pub use context::Transaction;
pub use state::TransactionState;
