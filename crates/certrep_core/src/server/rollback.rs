//! Background rollback worker.

use crate::client::ClientState;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Single consumer that completes rollbacks of BF-aborted idle
/// connections in FIFO order.
pub(crate) struct BackgroundRollbacker {
    sender: Mutex<Option<Sender<Arc<ClientState>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundRollbacker {
    pub(crate) fn start(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Arc<ClientState>>();
        let spawned = thread::Builder::new()
            .name(format!("{name}-rollbacker"))
            .spawn(move || {
                for client in receiver {
                    debug!(client_id = client.id().as_u64(), "background rollback");
                    if let Err(err) = client.background_rollback() {
                        error!(
                            client_id = client.id().as_u64(),
                            "background rollback failed: {err}"
                        );
                        client.abort();
                    }
                }
            });
        match spawned {
            Ok(handle) => Self {
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(handle)),
            },
            Err(err) => {
                error!("failed to spawn rollback worker: {err}");
                Self {
                    sender: Mutex::new(None),
                    worker: Mutex::new(None),
                }
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Queues a rollback. Returns false if the worker has stopped.
    pub(crate) fn submit(&self, client: Arc<ClientState>) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(client).is_ok(),
            None => false,
        }
    }

    /// Drains the queue and joins the worker.
    pub(crate) fn stop(&self) {
        drop(self.sender.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("rollback worker panicked");
            }
        }
    }
}
