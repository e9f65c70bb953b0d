//! Coordinator actor
//!
//! One task owns the playback machine, registry and scheduler and applies
//! commands strictly one at a time. Connections and timers talk to it only
//! through [`ServiceCommand`]s.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::registry::{PlaybackFlag, SessionRegistry};
use super::scheduler::Scheduler;
use super::{ConnectionId, ServiceConfig, ServiceError, ServiceEvent};
use crate::catalog::TrackCatalog;
use crate::clock::Clock;
use crate::sync::{
    ClientMessage, CommandError, PlaybackMachine, PlaybackSnapshot, Role, ServerMessage,
    SessionInfo,
};

/// Commands processed by the coordinator task
#[derive(Debug)]
pub enum ServiceCommand {
    /// A socket opened; reply with its connection id
    Connect {
        outbound: mpsc::UnboundedSender<ServerMessage>,
        reply: oneshot::Sender<ConnectionId>,
    },
    /// A parsed frame from a connection
    Message {
        conn: ConnectionId,
        message: ClientMessage,
    },
    /// A socket closed
    Disconnect { conn: ConnectionId },
    /// An auto-advance countdown expired
    TimerFired { generation: u64 },
    /// Read-only view of the whole service
    Inspect {
        reply: oneshot::Sender<ServiceSnapshot>,
    },
    Shutdown,
}

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub reference_time: i64,
    pub playback: PlaybackSnapshot,
    pub playlist: Vec<String>,
    pub next_override: Option<String>,
    pub sessions: Vec<SessionInfo>,
    pub controllers: usize,
    pub countdown_armed: bool,
}

/// Handle to the running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    command_tx: mpsc::UnboundedSender<ServiceCommand>,
    clock: Arc<dyn Clock>,
}

impl CoordinatorHandle {
    /// Register a new connection whose frames go to `outbound`
    pub async fn connect(
        &self,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<ConnectionId, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceCommand::Connect { outbound, reply })?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    pub fn deliver(&self, conn: ConnectionId, message: ClientMessage) -> Result<(), ServiceError> {
        self.send(ServiceCommand::Message { conn, message })
    }

    pub fn disconnect(&self, conn: ConnectionId) {
        let _ = self.send(ServiceCommand::Disconnect { conn });
    }

    pub async fn inspect(&self) -> Result<ServiceSnapshot, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceCommand::Inspect { reply })?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    /// Current reference time, readable from any task
    pub fn reference_now(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    pub fn shutdown(&self) {
        let _ = self.send(ServiceCommand::Shutdown);
    }

    fn send(&self, command: ServiceCommand) -> Result<(), ServiceError> {
        self.command_tx.send(command).map_err(|_| ServiceError::Closed)
    }
}

/// Owner of all authoritative session state
pub struct Coordinator {
    config: ServiceConfig,
    catalog: Arc<dyn TrackCatalog>,
    clock: Arc<dyn Clock>,
    machine: PlaybackMachine,
    registry: SessionRegistry,
    scheduler: Scheduler,
    /// Route for countdown expiries back into our own queue. Weak so the
    /// coordinator does not keep its own channel open.
    timer_tx: Option<mpsc::WeakUnboundedSender<ServiceCommand>>,
    events: Option<mpsc::UnboundedSender<ServiceEvent>>,
}

impl Coordinator {
    pub fn new(config: ServiceConfig, catalog: Arc<dyn TrackCatalog>, clock: Arc<dyn Clock>) -> Self {
        let mut machine = PlaybackMachine::new(catalog.clone(), config.back_threshold_ms);

        let playlist = if config.initial_playlist.is_empty() {
            catalog.tracks().into_iter().map(|t| t.id).collect()
        } else {
            config.initial_playlist.clone()
        };
        if let Err(e) = machine.set_playlist(playlist) {
            warn!("Initial playlist rejected ({}), using catalog order", e);
            let _ = machine.set_playlist(catalog.tracks().into_iter().map(|t| t.id).collect());
        }

        Self {
            config,
            catalog,
            clock,
            machine,
            registry: SessionRegistry::new(),
            scheduler: Scheduler::new(),
            timer_tx: None,
            events: None,
        }
    }

    /// Report activity on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ServiceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Spawn the coordinator task and return a handle to it
    pub fn start(mut self) -> CoordinatorHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.timer_tx = Some(command_tx.downgrade());

        let handle = CoordinatorHandle {
            command_tx,
            clock: self.clock.clone(),
        };

        tokio::spawn(self.run(command_rx));
        handle
    }

    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<ServiceCommand>) {
        info!(
            "Coordinator started: {} tracks, playlist of {}",
            self.catalog.tracks().len(),
            self.machine.playlist().len()
        );

        while let Some(command) = command_rx.recv().await {
            match command {
                ServiceCommand::Connect { outbound, reply } => {
                    let conn = self.registry.register(outbound);
                    debug!("{} connected", conn);
                    let _ = reply.send(conn);
                }
                ServiceCommand::Message { conn, message } => self.on_message(conn, message),
                ServiceCommand::Disconnect { conn } => self.on_disconnect(conn),
                ServiceCommand::TimerFired { generation } => self.on_timer(generation),
                ServiceCommand::Inspect { reply } => {
                    let _ = reply.send(self.inspect());
                }
                ServiceCommand::Shutdown => {
                    info!("Coordinator shutting down");
                    break;
                }
            }
        }

        self.scheduler.cancel();
    }

    fn inspect(&self) -> ServiceSnapshot {
        let (_, controllers, _) = self.registry.counts();
        ServiceSnapshot {
            reference_time: self.clock.now_ms(),
            playback: self.machine.snapshot(),
            playlist: self.machine.playlist().to_vec(),
            next_override: self.machine.next_override().map(str::to_string),
            sessions: self.registry.session_list(),
            controllers,
            countdown_armed: self.scheduler.is_armed(),
        }
    }

    // === Message handling ===

    fn on_message(&mut self, conn: ConnectionId, message: ClientMessage) {
        let role = self.registry.role(conn);
        if message.requires_controller() && role != Some(Role::Controller) {
            debug!("Ignoring {} from non-controller {}", message.name(), conn);
            return;
        }
        if message.requires_player() && role != Some(Role::Player) {
            debug!("Ignoring {} from non-player {}", message.name(), conn);
            return;
        }

        let command = message.name();
        let now = self.clock.now_ms();

        match message {
            ClientMessage::Hello { role } => self.on_hello(conn, role),
            ClientMessage::RegisterName { name } => {
                if self.registry.rename(conn, &name) {
                    self.publish_sessions();
                }
            }
            ClientMessage::Armed => {
                if self.registry.arm(conn) {
                    self.publish_sessions();
                }
            }
            ClientMessage::ReportPlaybackFlag { playing, paused } => {
                if self.registry.report(conn, PlaybackFlag::from_report(playing, paused)) {
                    self.publish_sessions();
                }
            }
            ClientMessage::Probe { send_time } => {
                self.registry.send(
                    conn,
                    ServerMessage::ProbeReply {
                        send_time,
                        reference_time: now,
                    },
                );
            }
            ClientMessage::CmdStart { track_id, delay_ms } => {
                self.transition(conn, command, |m| m.start(&track_id, delay_ms, now))
            }
            ClientMessage::CmdStop => self.transition(conn, command, |m| {
                m.stop();
                Ok(())
            }),
            ClientMessage::CmdPause => self.transition(conn, command, |m| m.pause(now)),
            ClientMessage::CmdResume => self.transition(conn, command, |m| m.resume(now)),
            ClientMessage::CmdSeek { track_id, offset_ms } => {
                self.transition(conn, command, |m| m.seek(offset_ms, track_id.as_deref(), now))
            }
            ClientMessage::CmdSkip => self.transition(conn, command, |m| m.skip(now)),
            ClientMessage::CmdBack => self.transition(conn, command, |m| m.back(now)),
            ClientMessage::CmdSetPlaylist { playlist } => {
                if self.apply(conn, command, |m| m.set_playlist(playlist)) {
                    self.publish_playlist();
                }
            }
            ClientMessage::CmdSetNextOverride { track_id } => {
                if self.apply(conn, command, |m| m.set_next_override(track_id)) {
                    self.publish_playlist();
                }
            }
            ClientMessage::CmdKick { session_id } => self.kick(conn, session_id),
        }
    }

    fn on_hello(&mut self, conn: ConnectionId, role: Role) {
        let previous = self.registry.role(conn);
        let session_id = self.registry.declare(conn, role);

        // Full pushes so a (re)joining device can resolve immediately
        self.registry.send(
            conn,
            ServerMessage::TrackCatalog {
                tracks: self.catalog.tracks(),
            },
        );
        if role == Role::Controller {
            self.registry.send(conn, self.playlist_message());
        }
        self.registry
            .send(conn, ServerMessage::StateSnapshot(self.machine.snapshot()));
        if role == Role::Controller {
            self.registry.send(
                conn,
                ServerMessage::SessionList {
                    sessions: self.registry.session_list(),
                },
            );
        }

        if previous != Some(role) {
            info!("{} joined as {:?} (session {:?})", conn, role, session_id);
            self.emit(ServiceEvent::Joined {
                conn,
                role,
                session_id,
            });
            self.publish_sessions();
        }
    }

    fn on_disconnect(&mut self, conn: ConnectionId) {
        let Some((role, session_id)) = self.registry.remove(conn) else {
            return;
        };

        info!("{} left ({:?})", conn, role);
        self.emit(ServiceEvent::Left {
            conn,
            role,
            session_id,
        });
        if role.is_some() {
            self.publish_sessions();
        }
    }

    fn kick(&mut self, conn: ConnectionId, session_id: u64) {
        let Some(target) = self.registry.find_session(session_id) else {
            self.reject(conn, "cmdKick", format!("Unknown session: {}", session_id));
            return;
        };

        self.registry.send(target, ServerMessage::Terminated);
        self.registry.remove(target);

        info!("Session {} kicked by {}", session_id, conn);
        self.emit(ServiceEvent::Kicked { session_id });
        self.emit(ServiceEvent::CommandApplied { command: "cmdKick" });
        self.publish_sessions();
    }

    // === Transitions ===

    /// Run a machine operation; on failure tell the sender only
    fn apply<F>(&mut self, conn: ConnectionId, command: &'static str, op: F) -> bool
    where
        F: FnOnce(&mut PlaybackMachine) -> Result<(), CommandError>,
    {
        match op(&mut self.machine) {
            Ok(()) => {
                debug!("{} from {} applied", command, conn);
                self.emit(ServiceEvent::CommandApplied { command });
                true
            }
            Err(e) => {
                self.reject(conn, command, e.to_string());
                false
            }
        }
    }

    /// Apply a playback transition, then rearm and publish
    fn transition<F>(&mut self, conn: ConnectionId, command: &'static str, op: F)
    where
        F: FnOnce(&mut PlaybackMachine) -> Result<(), CommandError>,
    {
        let override_before = self.machine.next_override().map(str::to_string);

        if self.apply(conn, command, op) {
            self.after_transition();
            if self.machine.next_override() != override_before.as_deref() {
                self.publish_playlist();
            }
        }
    }

    fn reject(&mut self, conn: ConnectionId, command: &'static str, reason: String) {
        warn!("{} from {} rejected: {}", command, conn, reason);
        self.registry.send(
            conn,
            ServerMessage::CommandRejected {
                command: command.to_string(),
                reason: reason.clone(),
            },
        );
        self.emit(ServiceEvent::CommandRejected { command, reason });
    }

    fn on_timer(&mut self, generation: u64) {
        if !self.scheduler.fire(generation) {
            return;
        }
        let Some(ended) = self.machine.state().track_id().map(str::to_string) else {
            return;
        };

        info!("Track {} reached its end", ended);
        self.registry.broadcast_controllers(&ServerMessage::TrackEnded {
            track_id: ended.clone(),
        });

        let had_override = self.machine.next_override().is_some();
        let next = self.machine.advance(self.clock.now_ms());
        match &next {
            Some(next) => info!("Auto-advancing {} -> {}", ended, next),
            None => info!("Nothing to play after {}, stopping", ended),
        }

        self.emit(ServiceEvent::AutoAdvanced {
            from: ended,
            to: next,
        });
        self.after_transition();
        if had_override {
            self.publish_playlist();
        }
    }

    fn after_transition(&mut self) {
        self.rearm();
        self.publish_state();
    }

    /// Cancel any countdown and arm a new one if a track is running
    fn rearm(&mut self) {
        self.scheduler.cancel();

        let Some(deadline) = self
            .machine
            .auto_advance_at(self.config.auto_advance_epsilon_ms)
        else {
            return;
        };

        let delay = Duration::from_millis(deadline.saturating_sub(self.clock.now_ms()).max(0) as u64);
        let timer_tx = self.timer_tx.clone();
        self.scheduler.arm(delay, move |generation| {
            if let Some(tx) = timer_tx.and_then(|weak| weak.upgrade()) {
                let _ = tx.send(ServiceCommand::TimerFired { generation });
            }
        });
    }

    // === Fan-out ===

    fn publish_state(&mut self) {
        let snapshot = self.machine.snapshot();
        self.registry
            .broadcast(&ServerMessage::StateSnapshot(snapshot.clone()));
        self.emit(ServiceEvent::StateChanged { snapshot });
    }

    fn publish_sessions(&mut self) {
        self.registry.broadcast_controllers(&ServerMessage::SessionList {
            sessions: self.registry.session_list(),
        });

        let (players, controllers, armed) = self.registry.counts();
        self.emit(ServiceEvent::SessionsChanged {
            players,
            controllers,
            armed,
        });
    }

    fn publish_playlist(&mut self) {
        self.registry.broadcast_controllers(&self.playlist_message());
    }

    fn playlist_message(&self) -> ServerMessage {
        ServerMessage::Playlist {
            playlist: self.machine.playlist().to_vec(),
            next_override: self.machine.next_override().map(str::to_string),
        }
    }

    fn emit(&self, event: ServiceEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
