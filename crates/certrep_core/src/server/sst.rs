//! State snapshot transfer hooks.

use crate::error::ReplResult;
use crate::types::Gtid;

/// External state transfer mechanism.
///
/// The server only tracks status around a transfer; moving the data is
/// entirely up to the implementation.
pub trait SstService: Send + Sync {
    /// Builds the request a joiner sends to its donor.
    fn sst_request(&self) -> ReplResult<String>;

    /// Starts sending a snapshot at `gtid` to the joiner that sent
    /// `request`. The implementation reports completion through
    /// [`crate::ServerState::sst_sent`].
    fn start_sst(&self, request: &str, gtid: &Gtid, bypass: bool) -> ReplResult<()>;
}
