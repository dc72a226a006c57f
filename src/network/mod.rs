//! Network subsystem: WebSocket voice transport

pub mod endpoint;
pub mod events;
pub mod queue;
pub mod roster;
pub mod session;
pub mod streaming;
pub mod supervisor;

pub use endpoint::Endpoint;
pub use events::{ConnectionState, LinkSignal, SessionEvent, SupervisorEvent};
pub use queue::{AudioSendQueue, PushOutcome};
pub use roster::FrequencyRoster;
pub use session::{ConnectParams, JoinedFrequency, SessionStats, TransportSession};
pub use streaming::StreamingClient;
pub use supervisor::{BackoffPolicy, ReconnectSupervisor};
