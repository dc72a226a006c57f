//! Events published by the session and the supervisor

use std::fmt;
use std::time::Duration;

use crate::protocol::RxAction;

/// Notifications for the UI, delivered in control-message arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Human-readable status line
    Status(String),
    /// Error reported by the relay or the transport
    Error(String),
    /// A remote party started or stopped transmitting
    RxStateChanged {
        user_id: String,
        display_name: String,
        freq_id: i32,
        action: RxAction,
    },
    FrequencyJoined {
        freq_id: i32,
        listener_count: u32,
    },
    ListenerCount {
        freq_id: i32,
        listener_count: u32,
    },
    MuteConfirmed {
        freq_id: i32,
        muted: bool,
    },
}

/// Raw link status reported by the session to its supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// Authenticated and ready
    Established,
    /// Dropped without a user-initiated disconnect
    Lost { reason: String },
}

/// Connection state owned by the supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StateChanged(ConnectionState),
    RetryScheduled { attempt: u32, delay: Duration },
    /// Recovered after a drop; dependents should re-join their frequencies
    Reconnected,
    /// Retries exhausted
    GaveUp,
}
