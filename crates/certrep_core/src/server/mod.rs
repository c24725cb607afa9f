//! Server and cluster membership state.
//!
//! A [`ServerState`] owns everything that is node-wide: the connection
//! registry, id allocation, the replayer gate, the background rollback
//! worker, the applier threads and the membership status machine.

mod applier;
mod node;
mod rollback;
mod sst;
mod status;

pub(crate) use node::NodeContext;
pub use sst::SstService;
pub use status::ServerStatus;

use crate::client::{ClientMode, ClientState, StorageTransaction};
use crate::config::ServerConfig;
use crate::error::{ReplError, ReplResult};
use crate::provider::{ReplicationProvider, StatusVariable};
use crate::reporter::{LogLevel, Progress, StatusReporter};
use crate::stats::StatsSnapshot;
use crate::types::{ClientId, Gtid, Id, TransactionId, View};
use applier::Applier;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A replicating database server.
pub struct ServerState {
    config: ServerConfig,
    node: Arc<NodeContext>,
    me: Weak<ServerState>,
    clients: RwLock<HashMap<ClientId, Arc<ClientState>>>,
    status: Mutex<ServerStatus>,
    status_cond: Condvar,
    view: Mutex<Option<View>>,
    sst: RwLock<Option<Arc<dyn SstService>>>,
    reporter: RwLock<Option<Arc<StatusReporter>>>,
    appliers: Mutex<Vec<JoinHandle<()>>>,
    fatal_error: Mutex<Option<String>>,
}

impl ServerState {
    /// Creates a disconnected server.
    pub fn new(config: ServerConfig, provider: Arc<dyn ReplicationProvider>) -> Arc<Self> {
        let node = Arc::new(NodeContext::new(&config, provider));
        Arc::new_cyclic(|me| Self {
            config,
            node,
            me: me.clone(),
            clients: RwLock::new(HashMap::new()),
            status: Mutex::new(ServerStatus::Disconnected),
            status_cond: Condvar::new(),
            view: Mutex::new(None),
            sst: RwLock::new(None),
            reporter: RwLock::new(None),
            appliers: Mutex::new(Vec::new()),
            fatal_error: Mutex::new(None),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the server name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the server id.
    pub fn id(&self) -> Id {
        self.config.id
    }

    /// Returns the provider.
    pub fn provider(&self) -> &Arc<dyn ReplicationProvider> {
        &self.node.provider
    }

    /// Returns a snapshot of the replication counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.node.stats.snapshot()
    }

    /// Returns the provider's diagnostic variables.
    pub fn provider_status(&self) -> Vec<StatusVariable> {
        self.node.provider.status()
    }

    /// Installs the state transfer mechanism.
    pub fn set_sst_service(&self, service: Arc<dyn SstService>) {
        *self.sst.write() = Some(service);
    }

    /// Installs a status file reporter.
    pub fn set_reporter(&self, reporter: Arc<StatusReporter>) {
        *self.reporter.write() = Some(reporter);
    }

    /// Allocates a node-unique transaction id.
    pub fn next_transaction_id(&self) -> TransactionId {
        self.node.next_transaction_id()
    }

    /// Opens a new connection in `mode`.
    pub fn open_client(
        &self,
        mode: ClientMode,
        storage: Arc<dyn StorageTransaction>,
    ) -> ReplResult<Arc<ClientState>> {
        let id = self.node.next_client_id();
        let client = ClientState::new(id, mode, Arc::clone(&self.node), storage);
        client.open()?;
        self.clients.write().insert(id, Arc::clone(&client));
        Ok(client)
    }

    /// Returns a registered connection.
    pub fn client(&self, id: ClientId) -> Option<Arc<ClientState>> {
        self.clients.read().get(&id).cloned()
    }

    /// Returns all registered connections.
    pub fn clients(&self) -> Vec<Arc<ClientState>> {
        self.clients.read().values().cloned().collect()
    }

    /// Closes a connection and removes it from the registry.
    pub fn close_client(&self, id: ClientId) -> ReplResult<()> {
        let client = self
            .clients
            .write()
            .remove(&id)
            .ok_or_else(|| ReplError::invalid_operation(format!("unknown {id}")))?;
        client.close()?;
        client.cleanup()
    }

    /// Returns the current status.
    pub fn status(&self) -> ServerStatus {
        *self.status.lock()
    }

    /// Blocks until the server reaches `status` or `timeout` elapses.
    /// Returns true if the status was reached.
    pub fn wait_until_state(&self, status: ServerStatus, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.status.lock();
        while *current != status {
            if self.status_cond.wait_until(&mut current, deadline).timed_out() {
                return *current == status;
            }
        }
        true
    }

    /// Storage engine initialization started.
    pub fn initializing(&self) -> ReplResult<()> {
        self.set_status(ServerStatus::Initializing)
    }

    /// Storage engine initialization finished.
    pub fn initialized(&self) -> ReplResult<()> {
        self.set_status(ServerStatus::Initialized)
    }

    /// Connects to the cluster through the provider.
    pub fn connect(&self, cluster_name: &str, address: &str, bootstrap: bool) -> ReplResult<()> {
        info!(
            server = %self.config.name,
            cluster = cluster_name,
            address,
            bootstrap,
            "connecting"
        );
        self.node
            .provider
            .connect(cluster_name, address, bootstrap)?;
        self.on_connect()
    }

    /// Disconnects from the cluster and joins the applier threads.
    pub fn disconnect(&self) -> ReplResult<()> {
        let current = self.status();
        if current == ServerStatus::Disconnected {
            return Ok(());
        }
        if current == ServerStatus::Synced {
            self.set_status(ServerStatus::Disconnecting)?;
        }
        let result = self.node.provider.disconnect();
        self.join_appliers();
        self.set_status(ServerStatus::Disconnected)?;
        result.map_err(ReplError::from)
    }

    /// Disconnects and stops the rollback worker.
    pub fn shutdown(&self) -> ReplResult<()> {
        let result = self.disconnect();
        self.node.rollbacker.stop();
        result
    }

    /// The provider established the connection.
    pub fn on_connect(&self) -> ReplResult<()> {
        self.set_status(ServerStatus::Connected)
    }

    /// Cluster membership changed.
    pub fn on_view(&self, view: &View) -> ReplResult<()> {
        info!(
            server = %self.config.name,
            view_seqno = view.view_seqno.get(),
            members = view.members.len(),
            status = ?view.status,
            "new view"
        );
        if !view.is_primary() {
            warn!(server = %self.config.name, "non-primary view");
        }
        *self.view.lock() = Some(view.clone());
        Ok(())
    }

    /// Returns the last installed view.
    pub fn current_view(&self) -> Option<View> {
        self.view.lock().clone()
    }

    /// The node caught up with the group.
    pub fn on_sync(&self) -> ReplResult<()> {
        match self.status() {
            ServerStatus::Synced => Ok(()),
            _ => self.set_status(ServerStatus::Synced),
        }
    }

    /// Joiner side: prepares to receive a snapshot and returns the request
    /// to send to the donor.
    pub fn prepare_for_sst(&self) -> ReplResult<String> {
        let service = self.sst_service()?;
        self.set_status(ServerStatus::Joiner)?;
        service.sst_request()
    }

    /// Donor side: a joiner requested a snapshot.
    pub fn on_sst_request(&self, request: &str, gtid: &Gtid, bypass: bool) -> ReplResult<()> {
        let service = self.sst_service()?;
        self.set_status(ServerStatus::Donor)?;
        service.start_sst(request, gtid, bypass)
    }

    /// Donor side: the snapshot was sent.
    pub fn sst_sent(&self, gtid: &Gtid, error: i32) -> ReplResult<()> {
        self.node.provider.sst_sent(gtid, error)?;
        if error != 0 {
            warn!(server = %self.config.name, error, "state transfer send failed");
        }
        self.set_status(ServerStatus::Joined)
    }

    /// Joiner side: the snapshot was received.
    pub fn sst_received(&self, gtid: &Gtid, error: i32) -> ReplResult<()> {
        self.node.provider.sst_received(gtid, error)?;
        if error != 0 {
            return Err(self.record_fatal(format!("state transfer receive failed: {error}")));
        }
        self.set_status(ServerStatus::Joined)
    }

    /// Starts an applier thread that runs the provider's receive loop.
    pub fn start_applier(&self, storage: Arc<dyn StorageTransaction>) -> ReplResult<ClientId> {
        let server = self
            .me
            .upgrade()
            .ok_or_else(|| ReplError::invalid_operation("server is shutting down"))?;
        let client = self.open_client(ClientMode::Applier, storage)?;
        let id = client.id();
        let applier = Applier { server, client };
        let handle = thread::Builder::new()
            .name(format!("{}-applier-{}", self.config.name, id.as_u64()))
            .spawn(move || {
                let result = applier.server.node.provider.run_applier(&applier);
                if let Err(err) = result {
                    applier.client.abort();
                    applier.server.record_fatal(format!("applier stopped: {err}"));
                }
            })?;
        self.appliers.lock().push(handle);
        Ok(id)
    }

    /// Returns the fatal error that stopped an applier, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_error.lock().clone()
    }

    fn record_fatal(&self, message: String) -> ReplError {
        error!(server = %self.config.name, "{message}");
        if let Some(reporter) = self.reporter.read().as_ref() {
            if let Err(err) = reporter.report_log_msg(LogLevel::Error, &message) {
                warn!("status report failed: {err}");
            }
        }
        self.fatal_error.lock().get_or_insert_with(|| message.clone());
        ReplError::Fatal(message)
    }

    fn sst_service(&self) -> ReplResult<Arc<dyn SstService>> {
        self.sst
            .read()
            .clone()
            .ok_or_else(|| ReplError::invalid_operation("no state transfer service installed"))
    }

    fn set_status(&self, next: ServerStatus) -> ReplResult<()> {
        {
            let mut current = self.status.lock();
            if !current.can_transition_to(next) {
                return Err(ReplError::IllegalServerTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
            info!(server = %self.config.name, "status {} -> {}", *current, next);
            *current = next;
            self.status_cond.notify_all();
        }
        if let Some(reporter) = self.reporter.read().as_ref() {
            if let Err(err) = reporter.report_state(next.as_str(), next.as_str(), Progress::default())
            {
                warn!("status report failed: {err}");
            }
        }
        Ok(())
    }

    fn join_appliers(&self) {
        let handles = std::mem::take(&mut *self.appliers.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(server = %self.config.name, "applier thread panicked");
            }
        }
    }
}

impl Drop for ServerState {
    fn drop(&mut self) {
        self.node.rollbacker.stop();
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("name", &self.config.name)
            .field("status", &self.status())
            .field("clients", &self.clients.read().len())
            .finish_non_exhaustive()
    }
}
