//! Coordination Service
//!
//! The authoritative side of a session: one actor task owns the playback
//! state machine, the session registry and the auto-advance scheduler;
//! every WebSocket connection feeds it through a [`CoordinatorHandle`].

mod coordinator;
mod registry;
mod scheduler;
mod transport;

pub use coordinator::{Coordinator, CoordinatorHandle, ServiceCommand, ServiceSnapshot};
pub use registry::{DeviceSession, PlaybackFlag, SessionRegistry};
pub use scheduler::Scheduler;
pub use transport::{serve, TransportError};

use thiserror::Error;

use crate::sync::{PlaybackSnapshot, Role, DEFAULT_BACK_THRESHOLD_MS};

/// Default lead time before a track's natural end at which auto-advance
/// fires
pub const DEFAULT_AUTO_ADVANCE_EPSILON_MS: i64 = 200;

/// Coordinator tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// `back` restarts the current track past this many ms
    pub back_threshold_ms: i64,
    /// Auto-advance fires this many ms before a track's end
    pub auto_advance_epsilon_ms: i64,
    /// Playlist at startup (empty = catalog order)
    pub initial_playlist: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            back_threshold_ms: DEFAULT_BACK_THRESHOLD_MS,
            auto_advance_epsilon_ms: DEFAULT_AUTO_ADVANCE_EPSILON_MS,
            initial_playlist: Vec::new(),
        }
    }
}

/// Connection-scoped id. A reconnect gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Activity reported by the coordinator (dashboard, logs)
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// A connection declared its role
    Joined {
        conn: ConnectionId,
        role: Role,
        session_id: Option<u64>,
    },
    /// A connection went away
    Left {
        conn: ConnectionId,
        role: Option<Role>,
        session_id: Option<u64>,
    },
    /// Registry counts after any registry change
    SessionsChanged {
        players: usize,
        controllers: usize,
        armed: usize,
    },
    StateChanged { snapshot: PlaybackSnapshot },
    CommandApplied { command: &'static str },
    CommandRejected { command: &'static str, reason: String },
    AutoAdvanced { from: String, to: Option<String> },
    Kicked { session_id: u64 },
}

/// Errors talking to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Coordinator task closed")]
    Closed,
}
