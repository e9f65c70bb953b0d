//! Session Registry
//!
//! Every open connection, its declared role and (for players) the device
//! session metadata shown to controllers. Also the fan-out point: each
//! connection owns an unbounded outbound queue, so a slow device never
//! stalls a broadcast.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use super::ConnectionId;
use crate::sync::{Role, ServerMessage, SessionInfo};

/// Self-reported playback status (advisory only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackFlag {
    #[default]
    NotPlaying,
    Playing,
    Paused,
}

impl PlaybackFlag {
    pub fn from_report(playing: bool, paused: bool) -> Self {
        match (playing, paused) {
            (_, true) => PlaybackFlag::Paused,
            (true, false) => PlaybackFlag::Playing,
            (false, false) => PlaybackFlag::NotPlaying,
        }
    }
}

/// A connected player device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    pub id: u64,
    pub display_name: Option<String>,
    pub armed: bool,
    pub flag: PlaybackFlag,
}

impl DeviceSession {
    fn new(id: u64) -> Self {
        Self {
            id,
            display_name: None,
            armed: false,
            flag: PlaybackFlag::NotPlaying,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            name: self.display_name.clone(),
            armed: self.armed,
            playing: self.flag == PlaybackFlag::Playing,
            paused: self.flag == PlaybackFlag::Paused,
        }
    }
}

#[derive(Debug)]
enum PeerRole {
    /// Connected, no hello yet
    Pending,
    Controller,
    Player(DeviceSession),
}

#[derive(Debug)]
struct Peer {
    outbound: mpsc::UnboundedSender<ServerMessage>,
    role: PeerRole,
}

/// Connections keyed by [`ConnectionId`]
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_connection: u64,
    next_session_id: u64,
    peers: HashMap<ConnectionId, Peer>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection (role still undeclared)
    pub fn register(&mut self, outbound: mpsc::UnboundedSender<ServerMessage>) -> ConnectionId {
        self.next_connection += 1;
        let conn = ConnectionId(self.next_connection);
        self.peers.insert(
            conn,
            Peer {
                outbound,
                role: PeerRole::Pending,
            },
        );
        conn
    }

    /// Forget a connection. Dropping its outbound sender ends its socket
    /// writer. Returns the role it had declared and its session id.
    pub fn remove(&mut self, conn: ConnectionId) -> Option<(Option<Role>, Option<u64>)> {
        let peer = self.peers.remove(&conn)?;
        Some(match peer.role {
            PeerRole::Pending => (None, None),
            PeerRole::Controller => (Some(Role::Controller), None),
            PeerRole::Player(session) => (Some(Role::Player), Some(session.id)),
        })
    }

    /// Declare the connection's role. Players get a fresh session id;
    /// re-declaring the same role is a no-op.
    pub fn declare(&mut self, conn: ConnectionId, role: Role) -> Option<u64> {
        let peer = self.peers.get_mut(&conn)?;

        match (&peer.role, role) {
            (PeerRole::Player(session), Role::Player) => return Some(session.id),
            (PeerRole::Controller, Role::Controller) => return None,
            _ => {}
        }

        peer.role = match role {
            Role::Controller => PeerRole::Controller,
            Role::Player => {
                self.next_session_id += 1;
                PeerRole::Player(DeviceSession::new(self.next_session_id))
            }
        };
        debug!("{} declared {:?}", conn, role);

        match &peer.role {
            PeerRole::Player(session) => Some(session.id),
            _ => None,
        }
    }

    pub fn role(&self, conn: ConnectionId) -> Option<Role> {
        match self.peers.get(&conn)?.role {
            PeerRole::Pending => None,
            PeerRole::Controller => Some(Role::Controller),
            PeerRole::Player(_) => Some(Role::Player),
        }
    }

    pub fn session(&self, conn: ConnectionId) -> Option<&DeviceSession> {
        match &self.peers.get(&conn)?.role {
            PeerRole::Player(session) => Some(session),
            _ => None,
        }
    }

    fn session_mut(&mut self, conn: ConnectionId) -> Option<&mut DeviceSession> {
        match &mut self.peers.get_mut(&conn)?.role {
            PeerRole::Player(session) => Some(session),
            _ => None,
        }
    }

    /// Set the display name. Blank names clear it. Returns whether
    /// anything changed.
    pub fn rename(&mut self, conn: ConnectionId, name: &str) -> bool {
        let trimmed = name.trim();
        let name = (!trimmed.is_empty()).then(|| trimmed.to_string());
        match self.session_mut(conn) {
            Some(session) if session.display_name != name => {
                session.display_name = name;
                true
            }
            _ => false,
        }
    }

    pub fn arm(&mut self, conn: ConnectionId) -> bool {
        match self.session_mut(conn) {
            Some(session) if !session.armed => {
                session.armed = true;
                true
            }
            _ => false,
        }
    }

    pub fn report(&mut self, conn: ConnectionId, flag: PlaybackFlag) -> bool {
        match self.session_mut(conn) {
            Some(session) if session.flag != flag => {
                session.flag = flag;
                true
            }
            _ => false,
        }
    }

    /// Connection owning the player session `session_id`
    pub fn find_session(&self, session_id: u64) -> Option<ConnectionId> {
        self.peers.iter().find_map(|(conn, peer)| match &peer.role {
            PeerRole::Player(session) if session.id == session_id => Some(*conn),
            _ => None,
        })
    }

    /// Player listing, ordered by session id
    pub fn session_list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .peers
            .values()
            .filter_map(|peer| match &peer.role {
                PeerRole::Player(session) => Some(session.info()),
                _ => None,
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Queue a message for one connection
    pub fn send(&self, conn: ConnectionId, message: ServerMessage) {
        if let Some(peer) = self.peers.get(&conn) {
            if peer.outbound.send(message).is_err() {
                debug!("{} outbound queue closed", conn);
            }
        }
    }

    /// Queue a message for every connection that declared a role
    pub fn broadcast(&self, message: &ServerMessage) {
        self.broadcast_where(message, |role| !matches!(role, PeerRole::Pending));
    }

    /// Queue a message for controllers only
    pub fn broadcast_controllers(&self, message: &ServerMessage) {
        self.broadcast_where(message, |role| matches!(role, PeerRole::Controller));
    }

    fn broadcast_where(&self, message: &ServerMessage, include: impl Fn(&PeerRole) -> bool) {
        for peer in self.peers.values().filter(|p| include(&p.role)) {
            let _ = peer.outbound.send(message.clone());
        }
    }

    /// (players, controllers, armed players)
    pub fn counts(&self) -> (usize, usize, usize) {
        self.peers
            .values()
            .fold((0, 0, 0), |(players, controllers, armed), peer| match &peer.role {
                PeerRole::Pending => (players, controllers, armed),
                PeerRole::Controller => (players, controllers + 1, armed),
                PeerRole::Player(s) => (players + 1, controllers, armed + s.armed as usize),
            })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
