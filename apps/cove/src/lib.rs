//! Client engine for cove hosts.
//!
//! Owns the multi-host registry, the per-host heartbeat loops and the
//! per-session websocket transports, and reports everything the UI
//! needs through a single [`ClientEvent`] stream. The engine never
//! draws anything itself; a terminal front end (see the `cove` binary)
//! or any other collaborator consumes the events.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod host;
pub mod pending;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod transport;

use cove_proto::{SessionInfo, SessionStatus, SystemSnapshot};

/// Globally unique session handle: hosts generate ids independently, so
/// a bare session id is ambiguous across hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub host_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(host_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host_id, self.session_id)
    }
}

/// Connection state of one host, driven by its heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Removed, or auth permanently revoked. No further heartbeats.
    Terminated,
}

/// Everything the engine reports to its consumer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionAdded { key: SessionKey, info: SessionInfo },
    SessionUpdated { key: SessionKey, info: SessionInfo },
    SessionRemoved { key: SessionKey },
    /// Full scrollback replay after (re)attaching a transport. Arrives
    /// before any `Output` for the same attachment; consumers must
    /// render it without treating the bytes as fresh activity.
    Snapshot { key: SessionKey, data: String },
    Output { key: SessionKey, data: String },
    SessionStatus { key: SessionKey, status: SessionStatus },
    FocusChanged { key: Option<SessionKey> },
    /// No sessions remain anywhere; the UI should show its empty state.
    EmptyState,
    HostStateChanged { host_id: String, state: HostState },
    /// Fresh machine metrics from a successful heartbeat, with the
    /// round-trip time of that heartbeat.
    SystemUpdate {
        host_id: String,
        system: SystemSnapshot,
        latency_ms: u64,
    },
    /// The host rejected our token. `forced` means the stored token was
    /// positively revoked (locked out), not merely missing.
    AuthRequired { host_id: String, forced: bool },
    /// An access gateway intercepted the request; the user must complete
    /// its login flow in a browser. The host token itself is still good.
    GatewayLogin { host_id: String, url: String },
    /// The primary host restarted; the consumer should reload itself.
    /// Emitted at most once per engine lifetime.
    ReloadRequired,
}
