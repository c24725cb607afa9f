//! # certrep loopback
//!
//! An in-process replication provider. Every node of a [`LoopbackGroup`]
//! lives in the same process and shares one ordering counter and one
//! certification index, which makes the group suitable for tests,
//! benchmarks and the simulator.
//!
//! ```no_run
//! use certrep_core::{ServerConfig, ServerState};
//! use certrep_loopback::{LoopbackConfig, LoopbackGroup, LoopbackProvider};
//! use std::sync::Arc;
//!
//! let group = LoopbackGroup::new(LoopbackConfig::default());
//! let config = ServerConfig::new().name("n1");
//! let provider = Arc::new(LoopbackProvider::new(group, config.id, "n1"));
//! let server = ServerState::new(config, provider);
//! server.connect("loopback", "loopback://n1", true).unwrap();
//! ```
//!
//! Certification is first-committer-wins on key digests: a write-set fails
//! when any of its keys was written, in a conflicting mode, by a write-set
//! ordered after the last seqno the transaction's node had committed when
//! the transaction started.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod group;
mod provider;

pub use config::LoopbackConfig;
pub use group::LoopbackGroup;
pub use provider::LoopbackProvider;
