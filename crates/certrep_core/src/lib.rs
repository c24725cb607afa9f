//! # certrep core
//!
//! Transaction replication core for certification-based multi-master
//! database clusters.
//!
//! This crate provides:
//! - The transaction state machine (certify, ordered commit, BF-abort, replay)
//! - Client connection state with command and statement hooks
//! - Server state: connection registry, appliers, membership status, SST hooks
//! - The replication provider contract and a scriptable mock provider
//! - Replication statistics and a JSON status reporter
//!
//! ## Architecture
//!
//! A database server embeds one [`ServerState`] per node. Every database
//! connection gets a [`ClientState`] whose transaction walks a fixed state
//! table:
//!
//! ```text
//! executing -> preparing -> certifying -> committing -> ordered_commit -> committed
//!      \            \             \             \
//!       +------------+-------------+-------------+--> must_abort -> aborting -> aborted
//!                                  \                      \
//!                                   cert_failed            must_replay -> replaying -> committing
//! ```
//!
//! The [`ReplicationProvider`] orders and certifies write-sets; the
//! [`StorageTransaction`] callbacks let the storage engine apply, commit
//! and roll back.
//!
//! ## Key Invariants
//!
//! - Commits become visible in provider-assigned seqno order
//! - A BF-abort never succeeds against a victim ordered before the aborter
//! - A certified transaction that loses a local conflict is replayed, never aborted
//! - Provider resources are released exactly once per transaction
//! - Protocol violations are fatal and surface as [`ReplError`]

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod provider;
mod reporter;
mod server;
mod stats;
mod transaction;
mod types;

pub use client::{ClientMode, ClientPhase, ClientState, MemoryStorage, StorageTransaction};
pub use config::{RollbackMode, ServerConfig};
pub use error::{ClientError, ProviderError, ProviderResult, ReplError, ReplResult};
pub use provider::{ApplyTarget, MockHook, MockProvider, ReplicationProvider, StatusVariable};
pub use reporter::{LogLevel, Progress, StatusReporter, MAX_LOG_MESSAGES};
pub use server::{ServerState, ServerStatus, SstService};
pub use stats::{ReplicationStats, StatsSnapshot};
pub use transaction::{Transaction, TransactionState};
pub use types::{
    ClientId, Gtid, Id, Key, KeyType, Member, Seqno, Stid, TransactionId, View, ViewStatus,
    WsFlags, WsHandle, WsMeta,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
