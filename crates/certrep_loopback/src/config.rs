//! Configuration for the loopback group.

use std::time::Duration;

/// Configuration shared by every node of a loopback group.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Name of the cluster.
    pub cluster_name: String,
    /// Maximum time a write-set waits for its turn in the commit order.
    pub commit_order_timeout: Duration,
    /// Maximum write-set payload size in bytes.
    pub max_ws_size: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            cluster_name: "loopback".to_string(),
            commit_order_timeout: Duration::from_secs(30),
            max_ws_size: 16 * 1024 * 1024,
        }
    }
}

impl LoopbackConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cluster name.
    #[must_use]
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Sets the commit-order wait timeout.
    #[must_use]
    pub fn with_commit_order_timeout(mut self, timeout: Duration) -> Self {
        self.commit_order_timeout = timeout;
        self
    }

    /// Sets the maximum write-set size.
    #[must_use]
    pub fn with_max_ws_size(mut self, size: usize) -> Self {
        self.max_ws_size = size;
        self
    }
}
