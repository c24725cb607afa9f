//! # certrep sim
//!
//! Load-testing simulator for the replication state machine. It starts a
//! cluster of loopback servers, runs many client connections against it
//! and reports the replication counters.
//!
//! Each client runs its transactions as two commands, one that writes and
//! one that commits, so BF-aborts hit both executing and idle connections.
//! Applied write-sets BF-abort random local transactions with a configurable
//! frequency to stand in for storage lock conflicts.
//!
//! ```no_run
//! use certrep_sim::{SimParams, Simulator};
//!
//! let report = Simulator::new(SimParams::new().servers(3).alg_freq(10))
//!     .run()
//!     .unwrap();
//! report.print_summary();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod params;
mod simulator;
mod storage;

pub use error::{SimError, SimResult};
pub use params::SimParams;
pub use simulator::{ServerReport, SimReport, Simulator};
pub use storage::{SimStorage, SimStorageEngine};
