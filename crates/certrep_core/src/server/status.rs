//! Node status machine.

use std::fmt;

/// Membership status of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    /// Not connected to a cluster.
    Disconnected,
    /// Storage engine is initializing.
    Initializing,
    /// Storage engine is initialized.
    Initialized,
    /// Connected to the cluster, not yet joined.
    Connected,
    /// Receiving a state snapshot.
    Joiner,
    /// Caught up with a snapshot, applying the backlog.
    Joined,
    /// Sending a state snapshot to a joiner.
    Donor,
    /// Fully in sync with the group.
    Synced,
    /// Leaving the cluster.
    Disconnecting,
}

impl ServerStatus {
    /// All statuses, in declaration order.
    pub const ALL: [ServerStatus; 9] = [
        ServerStatus::Disconnected,
        ServerStatus::Initializing,
        ServerStatus::Initialized,
        ServerStatus::Connected,
        ServerStatus::Joiner,
        ServerStatus::Joined,
        ServerStatus::Donor,
        ServerStatus::Synced,
        ServerStatus::Disconnecting,
    ];

    /// Returns true if `self -> next` is a legal move.
    pub fn can_transition_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        match self {
            Disconnected => matches!(next, Initializing | Connected),
            Initializing => matches!(next, Disconnected | Initialized),
            Initialized => matches!(next, Disconnected | Connected | Joined),
            Connected => matches!(next, Disconnected | Joiner | Synced),
            Joiner => matches!(next, Disconnected | Initializing | Joined),
            Joined => matches!(next, Disconnected | Synced),
            Donor => matches!(next, Disconnected | Joined),
            Synced => matches!(next, Disconnected | Donor | Disconnecting),
            Disconnecting => matches!(next, Disconnected),
        }
    }

    /// Returns the lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Initializing => "initializing",
            ServerStatus::Initialized => "initialized",
            ServerStatus::Connected => "connected",
            ServerStatus::Joiner => "joiner",
            ServerStatus::Joined => "joined",
            ServerStatus::Donor => "donor",
            ServerStatus::Synced => "synced",
            ServerStatus::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
