//! Applier side of a server: drives replicated write-sets into storage.

use super::ServerState;
use crate::client::ClientState;
use crate::error::{ReplError, ReplResult};
use crate::provider::ApplyTarget;
use crate::types::{View, WsHandle, WsMeta};
use std::sync::Arc;
use tracing::error;

/// Binds an applier connection to its server for the provider's receive
/// loop.
pub(crate) struct Applier {
    pub(crate) server: Arc<ServerState>,
    pub(crate) client: Arc<ClientState>,
}

impl ApplyTarget for Applier {
    fn apply(&self, handle: &WsHandle, meta: &WsMeta, data: &[u8]) -> ReplResult<()> {
        self.server.on_apply(&self.client, handle, meta, data)
    }

    fn on_view(&self, view: &View) -> ReplResult<()> {
        self.server.on_view(view)
    }

    fn on_sync(&self) -> ReplResult<()> {
        self.server.on_sync()
    }
}

impl ServerState {
    /// Applies one replicated write-set on an applier connection.
    ///
    /// Only write-sets that both start and commit a transaction are
    /// supported; isolation and streaming fragments are refused.
    pub fn on_apply(
        &self,
        client: &ClientState,
        handle: &WsHandle,
        meta: &WsMeta,
        data: &[u8],
    ) -> ReplResult<()> {
        let flags = meta.flags;
        if flags.is_isolation() {
            return Err(ReplError::unimplemented("applying total order isolation"));
        }
        if !(flags.starts_transaction() && flags.commits_transaction()) {
            let what = if flags.rolls_back_transaction() {
                "applying streaming rollback"
            } else {
                "applying streaming fragment"
            };
            return Err(ReplError::unimplemented(what));
        }

        client.before_command()?;
        client.before_statement()?;
        client.start_applying(*handle, *meta)?;
        client
            .storage()
            .apply(client, meta, data)
            .map_err(|err| {
                error!(
                    client_id = client.id().as_u64(),
                    seqno = meta.seqno().get(),
                    "failed to apply write-set: {err}"
                );
                ReplError::fatal(format!("apply of seqno {} failed: {err}", meta.seqno()))
            })?;
        client.commit()?;
        client.after_statement()?;
        client.after_command_before_result()?;
        client.after_command_after_result()
    }
}
