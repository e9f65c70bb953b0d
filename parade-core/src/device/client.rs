//! Device connection task
//!
//! Owns the WebSocket to the coordinator. Re-introduces itself and resyncs
//! its clock on every (re)connect, answers [`DeviceHandle`] commands and
//! hands every resolved playback change to the [`LocalPlayer`].

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::state::{DeviceState, PlayerInstruction};
use super::{DeviceConfig, DeviceError, DeviceEvent, LocalPlayer};
use crate::catalog::TrackInfo;
use crate::clock::{Clock, ReplyOutcome, SyncError};
use crate::sync::{ClientMessage, PlaybackSnapshot, Role, ServerMessage};

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Commands sent to the device task
#[derive(Debug)]
enum DeviceCommand {
    RegisterName(String),
    Arm,
    BeginSync {
        sample_count: usize,
        reply: oneshot::Sender<Result<f64, SyncError>>,
    },
    Send(ClientMessage),
    Shutdown,
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Terminated,
    Shutdown,
}

/// Handle to a running device client
#[derive(Clone)]
pub struct DeviceHandle {
    command_tx: mpsc::UnboundedSender<DeviceCommand>,
    state: Arc<RwLock<DeviceState>>,
    clock: Arc<dyn Clock>,
    sample_count: usize,
}

impl DeviceHandle {
    /// Set the name shown to controllers
    pub fn register_name(&self, name: &str) -> Result<(), DeviceError> {
        self.send_command(DeviceCommand::RegisterName(name.to_string()))
    }

    /// Declare local audio ready. Playback only starts once armed.
    pub fn arm(&self) -> Result<(), DeviceError> {
        self.send_command(DeviceCommand::Arm)
    }

    /// Run the offset estimator with `sample_count` probes.
    ///
    /// Resolves with the new offset, or with [`SyncError::SessionClosed`]
    /// if the connection goes away first.
    pub async fn begin_sync(&self, sample_count: usize) -> Result<f64, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(DeviceCommand::BeginSync { sample_count, reply })
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.unwrap_or(Err(SyncError::SessionClosed))
    }

    /// Re-run the estimator with the configured sample count. Current
    /// playback is not interrupted.
    pub async fn resync(&self) -> Result<f64, SyncError> {
        self.begin_sync(self.sample_count).await
    }

    /// [`begin_sync`](Self::begin_sync) bounded by `timeout`
    pub async fn sync_with_timeout(&self, sample_count: usize, timeout: Duration) -> Result<f64, SyncError> {
        tokio::time::timeout(timeout, self.begin_sync(sample_count))
            .await
            .unwrap_or(Err(SyncError::Timeout(timeout)))
    }

    /// Reference time now. None until the first sync converges.
    pub fn now(&self) -> Option<i64> {
        self.state.read().shared_now(self.clock.now_ms())
    }

    pub fn offset_ms(&self) -> Option<f64> {
        self.state.read().estimator().offset_ms()
    }

    pub fn snapshot(&self) -> Option<PlaybackSnapshot> {
        self.state.read().snapshot().cloned()
    }

    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.state.read().tracks()
    }

    pub fn is_armed(&self) -> bool {
        self.state.read().is_armed()
    }

    /// Send a raw message (controller commands)
    pub fn send(&self, message: ClientMessage) -> Result<(), DeviceError> {
        self.send_command(DeviceCommand::Send(message))
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(DeviceCommand::Shutdown);
    }

    fn send_command(&self, command: DeviceCommand) -> Result<(), DeviceError> {
        self.command_tx.send(command).map_err(|_| DeviceError::Closed)
    }
}

/// Device client - runs in a background task
pub struct DeviceClient {
    config: DeviceConfig,
    clock: Arc<dyn Clock>,
    player: Arc<dyn LocalPlayer>,
    state: Arc<RwLock<DeviceState>>,
    events: Option<mpsc::UnboundedSender<DeviceEvent>>,
    /// Callers waiting on the current sync run
    sync_waiters: Vec<oneshot::Sender<Result<f64, SyncError>>>,
    /// When the current sync run is abandoned
    sync_deadline: Option<Instant>,
}

impl DeviceClient {
    pub fn new(mut config: DeviceConfig, clock: Arc<dyn Clock>, player: Arc<dyn LocalPlayer>) -> Self {
        config.sample_count = config.sample_count.max(1);

        let mut state = DeviceState::new();
        state.set_display_name(config.display_name.clone());

        Self {
            config,
            clock,
            player,
            state: Arc::new(RwLock::new(state)),
            events: None,
            sync_waiters: Vec::new(),
            sync_deadline: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Spawn the client task and return a handle to it
    pub fn start(self) -> DeviceHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = DeviceHandle {
            command_tx,
            state: self.state.clone(),
            clock: self.clock.clone(),
            sample_count: self.config.sample_count,
        };

        tokio::spawn(self.run(command_rx));
        handle
    }

    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<DeviceCommand>) {
        let mut backoff = Backoff::new();

        loop {
            match self.connect_and_run(&mut command_rx, &mut backoff).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Terminated) => {
                    info!("Session terminated by a controller");
                    break;
                }
                Ok(SessionEnd::Lost) => info!("Connection to {} lost", self.config.url),
                Err(e) => warn!("Connection to {} failed: {}", self.config.url, e),
            }

            if !self.config.reconnect {
                break;
            }

            let delay = backoff.next();
            info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());
            self.emit(DeviceEvent::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            });
            if !self.wait_offline(delay, &mut command_rx).await {
                break;
            }
        }

        self.fail_waiters(SyncError::SessionClosed);
        info!("Device client stopped");
    }

    async fn connect_and_run(
        &mut self,
        command_rx: &mut mpsc::UnboundedReceiver<DeviceCommand>,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd, DeviceError> {
        debug!("Connecting to {}", self.config.url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        backoff.reset();

        info!("Connected to {}", self.config.url);
        self.emit(DeviceEvent::Connected);

        let outcome = self.run_session(ws_stream, command_rx).await;

        // Anything in flight belonged to the old connection
        self.sync_deadline = None;
        {
            let mut state = self.state.write();
            state.estimator_mut().abandon_run();
            state.reset_reports();
        }
        self.fail_waiters(SyncError::SessionClosed);
        self.emit(DeviceEvent::Disconnected);

        outcome
    }

    async fn run_session(
        &mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        command_rx: &mut mpsc::UnboundedReceiver<DeviceCommand>,
    ) -> Result<SessionEnd, DeviceError> {
        let (mut write, mut read) = ws_stream.split();

        send(&mut write, &ClientMessage::Hello { role: self.config.role }).await?;
        if self.config.role == Role::Player {
            let (name, armed) = {
                let state = self.state.read();
                (state.display_name().map(str::to_string), state.is_armed())
            };
            if let Some(name) = name {
                send(&mut write, &ClientMessage::RegisterName { name }).await?;
            }
            if armed {
                send(&mut write, &ClientMessage::Armed).await?;
            }

            let flag = self.state.write().flag_for_new_session();
            if let Some((playing, paused)) = flag {
                send(&mut write, &ClientMessage::ReportPlaybackFlag { playing, paused }).await?;
            }
        }

        self.start_sync_run(&mut write, self.config.sample_count).await?;

        let mut resync = self.config.resync_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            tokio::select! {
                incoming = read.next() => {
                    let msg = match incoming {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(SessionEnd::Lost),
                    };

                    match msg {
                        Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(message) => {
                                if let Some(end) = self.on_server_message(&mut write, message).await? {
                                    return Ok(end);
                                }
                            }
                            Err(e) => warn!("Malformed frame from coordinator: {}", e),
                        },
                        Message::Close(_) => return Ok(SessionEnd::Lost),
                        _ => {}
                    }
                }
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        return Ok(SessionEnd::Shutdown);
                    };
                    if let Some(end) = self.on_command(&mut write, command).await? {
                        return Ok(end);
                    }
                }
                _ = tick(&mut resync) => {
                    let running = self.state.read().estimator().is_running();
                    if !running {
                        debug!("Periodic clock resync");
                        self.start_sync_run(&mut write, self.config.sample_count).await?;
                    }
                }
                _ = sleep_until(self.sync_deadline) => self.on_sync_timeout(),
            }
        }
    }

    async fn on_server_message(
        &mut self,
        write: &mut WsWrite,
        message: ServerMessage,
    ) -> Result<Option<SessionEnd>, DeviceError> {
        match message {
            ServerMessage::ProbeReply {
                send_time,
                reference_time,
            } => {
                let local_receive = self.clock.now_ms();
                let outcome = self
                    .state
                    .write()
                    .estimator_mut()
                    .handle_reply(send_time, reference_time, local_receive);

                match outcome {
                    ReplyOutcome::Rejected => debug!("Discarding unmatched probe reply {}", send_time),
                    ReplyOutcome::Recorded { .. } => {}
                    ReplyOutcome::Converged(offset_ms) => {
                        self.sync_deadline = None;
                        info!("Clock synced: offset {:.1}ms", offset_ms);
                        for waiter in self.sync_waiters.drain(..) {
                            let _ = waiter.send(Ok(offset_ms));
                        }
                        self.emit(DeviceEvent::Synced { offset_ms });
                        self.reconcile(write).await?;
                    }
                }
            }
            ServerMessage::StateSnapshot(snapshot) => {
                debug!("State snapshot: {:?}", snapshot);
                self.state.write().set_snapshot(snapshot.clone());
                self.emit(DeviceEvent::StateChanged { snapshot });
                self.reconcile(write).await?;
            }
            ServerMessage::TrackCatalog { tracks } => {
                debug!("Catalog with {} tracks", tracks.len());
                self.state.write().set_catalog(tracks.clone());
                self.emit(DeviceEvent::Catalog { tracks });
                self.reconcile(write).await?;
            }
            ServerMessage::SessionList { sessions } => {
                self.emit(DeviceEvent::Sessions { sessions });
            }
            ServerMessage::Playlist {
                playlist,
                next_override,
            } => {
                self.emit(DeviceEvent::Playlist {
                    playlist,
                    next_override,
                });
            }
            ServerMessage::TrackEnded { track_id } => {
                self.emit(DeviceEvent::TrackEnded { track_id });
            }
            ServerMessage::CommandRejected { command, reason } => {
                warn!("Coordinator rejected {}: {}", command, reason);
                self.emit(DeviceEvent::CommandRejected { command, reason });
            }
            ServerMessage::Terminated => {
                self.player.stop();
                self.emit(DeviceEvent::Terminated);
                return Ok(Some(SessionEnd::Terminated));
            }
        }
        Ok(None)
    }

    async fn on_command(
        &mut self,
        write: &mut WsWrite,
        command: DeviceCommand,
    ) -> Result<Option<SessionEnd>, DeviceError> {
        match command {
            DeviceCommand::RegisterName(name) => {
                self.state.write().set_display_name(Some(name.clone()));
                send(write, &ClientMessage::RegisterName { name }).await?;
            }
            DeviceCommand::Arm => {
                self.state.write().arm();
                send(write, &ClientMessage::Armed).await?;
                self.reconcile(write).await?;
            }
            DeviceCommand::BeginSync { sample_count, reply } => {
                if sample_count == 0 {
                    let _ = reply.send(Err(SyncError::NoProbes));
                } else {
                    self.sync_waiters.push(reply);
                    self.start_sync_run(write, sample_count).await?;
                }
            }
            DeviceCommand::Send(message) => send(write, &message).await?,
            DeviceCommand::Shutdown => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(Some(SessionEnd::Shutdown));
            }
        }
        Ok(None)
    }

    /// Handle a command while disconnected. Returns false on shutdown.
    async fn wait_offline(
        &mut self,
        delay: Duration,
        command_rx: &mut mpsc::UnboundedReceiver<DeviceCommand>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = command_rx.recv() => match command {
                    None | Some(DeviceCommand::Shutdown) => return false,
                    // Remembered and re-sent on reconnect
                    Some(DeviceCommand::RegisterName(name)) => {
                        self.state.write().set_display_name(Some(name));
                    }
                    Some(DeviceCommand::Arm) => self.state.write().arm(),
                    Some(DeviceCommand::BeginSync { reply, .. }) => {
                        let _ = reply.send(Err(SyncError::SessionClosed));
                    }
                    Some(DeviceCommand::Send(message)) => {
                        debug!("Dropping {} while disconnected", message.name());
                    }
                },
            }
        }
    }

    /// Start a new estimator run, superseding any run in flight
    async fn start_sync_run(&mut self, write: &mut WsWrite, sample_count: usize) -> Result<(), DeviceError> {
        self.state.write().estimator_mut().begin_run(sample_count)?;
        self.sync_deadline = Some(Instant::now() + self.config.sync_timeout);

        for _ in 0..sample_count {
            let send_time = self
                .state
                .write()
                .estimator_mut()
                .create_probe(self.clock.now_ms());
            send(write, &ClientMessage::Probe { send_time }).await?;
        }
        debug!("Sent {} clock probes", sample_count);
        Ok(())
    }

    fn on_sync_timeout(&mut self) {
        self.sync_deadline = None;
        self.state.write().estimator_mut().abandon_run();

        let timeout = self.config.sync_timeout;
        warn!("Clock sync did not converge within {:?}", timeout);
        self.fail_waiters(SyncError::Timeout(timeout));
        self.emit(DeviceEvent::SyncFailed {
            reason: SyncError::Timeout(timeout).to_string(),
        });
    }

    /// Apply the current snapshot to the local player if it changed
    async fn reconcile(&mut self, write: &mut WsWrite) -> Result<(), DeviceError> {
        let result = self.state.write().reconcile(self.clock.now_ms());

        let instruction = match result {
            Ok(Some(instruction)) => instruction,
            Ok(None) => return Ok(()),
            Err(reason) => {
                debug!("Snapshot not applied yet: {:?}", reason);
                self.emit(DeviceEvent::Blocked { reason });
                return Ok(());
            }
        };

        match &instruction {
            PlayerInstruction::Play { track, start } => {
                info!("Playing {} ({:?})", track.id, start);
                self.player.play(track, *start);
            }
            PlayerInstruction::Hold { track, offset_ms } => {
                info!("Holding {} at {}ms", track.id, offset_ms);
                self.player.hold(track, *offset_ms);
            }
            PlayerInstruction::Stop => {
                info!("Stopping playback");
                self.player.stop();
            }
        }

        let report = self.state.write().take_flag_report(&instruction);
        if let Some((playing, paused)) = report {
            send(write, &ClientMessage::ReportPlaybackFlag { playing, paused }).await?;
        }
        Ok(())
    }

    fn fail_waiters(&mut self, error: SyncError) {
        for waiter in self.sync_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn emit(&self, event: DeviceEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

async fn send(write: &mut WsWrite, message: &ClientMessage) -> Result<(), DeviceError> {
    let json = serde_json::to_string(message)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{abc_catalog, track};
    use crate::clock::{MonotonicClock, SkewedClock};
    use crate::device::PlaybackStart;
    use crate::service::{serve, Coordinator, CoordinatorHandle, ServiceConfig};
    use crate::sync::Mode;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    const SERVER_SKEW_MS: i64 = 3_600_000;

    #[derive(Default)]
    struct RecordingPlayer {
        calls: Mutex<Vec<PlayerInstruction>>,
    }

    impl RecordingPlayer {
        fn calls(&self) -> Vec<PlayerInstruction> {
            self.calls.lock().clone()
        }
    }

    impl LocalPlayer for RecordingPlayer {
        fn play(&self, track: &TrackInfo, start: PlaybackStart) {
            self.calls.lock().push(PlayerInstruction::Play {
                track: track.clone(),
                start,
            });
        }

        fn hold(&self, track: &TrackInfo, offset_ms: i64) {
            self.calls.lock().push(PlayerInstruction::Hold {
                track: track.clone(),
                offset_ms,
            });
        }

        fn stop(&self) {
            self.calls.lock().push(PlayerInstruction::Stop);
        }
    }

    /// Coordinator whose reference clock runs an hour ahead of the devices
    async fn start_server() -> (String, CoordinatorHandle) {
        let coordinator = Coordinator::new(
            ServiceConfig::default(),
            Arc::new(abc_catalog()),
            Arc::new(SkewedClock::new(MonotonicClock::new(), SERVER_SKEW_MS)),
        )
        .start();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, coordinator.clone()));
        (url, coordinator)
    }

    fn start_device(
        config: DeviceConfig,
    ) -> (
        DeviceHandle,
        Arc<RecordingPlayer>,
        mpsc::UnboundedReceiver<DeviceEvent>,
    ) {
        let player = Arc::new(RecordingPlayer::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = DeviceClient::new(config, Arc::new(MonotonicClock::new()), player.clone())
            .with_events(events_tx)
            .start();
        (handle, player, events_rx)
    }

    async fn wait_for_event(
        events: &mut mpsc::UnboundedReceiver<DeviceEvent>,
        pred: impl Fn(&DeviceEvent) -> bool,
    ) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("device task ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for device event")
    }

    #[tokio::test]
    async fn test_device_syncs_to_skewed_reference() {
        let (url, _coordinator) = start_server().await;
        let mut config = DeviceConfig::new(url);
        config.resync_interval = None;
        let (device, _player, mut events) = start_device(config);

        assert_eq!(device.now(), None);
        wait_for_event(&mut events, |e| *e == DeviceEvent::Connected).await;

        let offset = device
            .sync_with_timeout(10, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(
            (offset - SERVER_SKEW_MS as f64).abs() < 50.0,
            "offset {} too far from {}",
            offset,
            SERVER_SKEW_MS
        );

        let now = device.now().unwrap();
        let expected = MonotonicClock::new().now_ms() + SERVER_SKEW_MS;
        assert!((now - expected).abs() < 100);
        device.shutdown();
    }

    #[tokio::test]
    async fn test_armed_device_follows_controller() {
        let (url, coordinator) = start_server().await;

        let mut config = DeviceConfig::new(url.clone());
        config.display_name = Some("Lobby".to_string());
        config.resync_interval = None;
        let (device, player, mut events) = start_device(config);
        wait_for_event(&mut events, |e| matches!(e, DeviceEvent::Synced { .. })).await;
        device.arm().unwrap();

        let mut controller_config = DeviceConfig::new(url);
        controller_config.role = Role::Controller;
        controller_config.resync_interval = None;
        let (controller, _controller_player, mut controller_events) = start_device(controller_config);
        wait_for_event(&mut controller_events, |e| matches!(e, DeviceEvent::Sessions { .. })).await;

        controller
            .send(ClientMessage::CmdStart {
                track_id: "C".into(),
                delay_ms: 2_000,
            })
            .unwrap();
        let scheduled_at = MonotonicClock::new().now_ms();

        wait_for_event(&mut events, |e| {
            matches!(e, DeviceEvent::StateChanged { snapshot } if snapshot.track_id.as_deref() == Some("C"))
        })
        .await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while player.calls().is_empty() {
            assert!(Instant::now() < deadline, "player never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        match player.calls().as_slice() {
            [PlayerInstruction::Play {
                track,
                start: PlaybackStart::AtLocalTime(at),
            }] => {
                assert_eq!(track.id, "C");
                let lead = at - scheduled_at;
                assert!((1_800..=2_200).contains(&lead), "lead {}", lead);
            }
            other => panic!("unexpected player calls: {:?}", other),
        }

        // The coordinator sees the name, the arm and the playing flag
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let sessions = coordinator.inspect().await.unwrap().sessions;
            if sessions.len() == 1 && sessions[0].playing {
                assert_eq!(sessions[0].name.as_deref(), Some("Lobby"));
                assert!(sessions[0].armed);
                break;
            }
            assert!(Instant::now() < deadline, "flag never reported");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        device.shutdown();
        controller.shutdown();
    }

    #[tokio::test]
    async fn test_unarmed_device_stays_silent() {
        let (url, coordinator) = start_server().await;
        let mut config = DeviceConfig::new(url);
        config.resync_interval = None;
        let (_device, player, mut events) = start_device(config);
        wait_for_event(&mut events, |e| matches!(e, DeviceEvent::Synced { .. })).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = coordinator.connect(tx).await.unwrap();
        coordinator
            .deliver(conn, ClientMessage::Hello { role: Role::Controller })
            .unwrap();
        coordinator.deliver(conn, ClientMessage::CmdSkip).unwrap();

        wait_for_event(&mut events, |e| {
            matches!(e, DeviceEvent::StateChanged { snapshot } if snapshot.track_id.as_deref() == Some("A"))
        })
        .await;
        let blocked = wait_for_event(&mut events, |e| matches!(e, DeviceEvent::Blocked { .. })).await;
        assert_eq!(
            blocked,
            DeviceEvent::Blocked {
                reason: crate::device::Blocked::NotArmed
            }
        );
        assert!(player.calls().is_empty());
    }

    #[tokio::test]
    async fn test_kicked_device_stops_for_good() {
        let (url, coordinator) = start_server().await;
        let (device, player, mut events) = start_device(DeviceConfig::new(url));
        wait_for_event(&mut events, |e| *e == DeviceEvent::Connected).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        let session_id = loop {
            if let Some(session) = coordinator.inspect().await.unwrap().sessions.first() {
                break session.id;
            }
            assert!(Instant::now() < deadline, "device never joined");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = coordinator.connect(tx).await.unwrap();
        coordinator
            .deliver(conn, ClientMessage::Hello { role: Role::Controller })
            .unwrap();
        coordinator
            .deliver(conn, ClientMessage::CmdKick { session_id })
            .unwrap();

        wait_for_event(&mut events, |e| *e == DeviceEvent::Terminated).await;
        assert_eq!(player.calls().last(), Some(&PlayerInstruction::Stop));
        assert_eq!(device.begin_sync(4).await, Err(SyncError::SessionClosed));
    }

    #[tokio::test]
    async fn test_sync_times_out_without_replies() {
        // Accepts the socket but never answers a probe
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut config = DeviceConfig::new(url);
        config.sync_timeout = Duration::from_millis(200);
        config.resync_interval = None;
        let (device, _player, mut events) = start_device(config);
        wait_for_event(&mut events, |e| *e == DeviceEvent::Connected).await;

        assert_eq!(
            device.begin_sync(5).await,
            Err(SyncError::Timeout(Duration::from_millis(200)))
        );
        assert_eq!(device.now(), None);
        assert_eq!(
            device.sync_with_timeout(5, Duration::from_millis(50)).await,
            Err(SyncError::Timeout(Duration::from_millis(50)))
        );
        assert_eq!(device.begin_sync(0).await, Err(SyncError::NoProbes));
    }

    /// Hosts one device connection. Answers clock requests on the device's
    /// own clock and pushes a fixed playing snapshot after the hello. The
    /// first connection is dropped once the device reports that it plays.
    async fn host_playing_session(
        mut ws: WebSocketStream<TcpStream>,
        round: usize,
        snapshot: PlaybackSnapshot,
        seen: mpsc::UnboundedSender<(usize, ClientMessage)>,
    ) {
        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else { continue };
            let msg: ClientMessage = serde_json::from_str(text.as_str()).unwrap();
            let replies = match &msg {
                ClientMessage::Hello { .. } => vec![
                    ServerMessage::TrackCatalog {
                        tracks: vec![track("A", 600_000)],
                    },
                    ServerMessage::StateSnapshot(snapshot.clone()),
                ],
                ClientMessage::Probe { send_time } => vec![ServerMessage::ProbeReply {
                    send_time: *send_time,
                    reference_time: MonotonicClock::new().now_ms(),
                }],
                _ => Vec::new(),
            };
            let drop_now = round == 0
                && matches!(msg, ClientMessage::ReportPlaybackFlag { playing: true, .. });
            let _ = seen.send((round, msg));
            if drop_now {
                return;
            }
            for reply in replies {
                let json = serde_json::to_string(&reply).unwrap();
                ws.send(Message::Text(json.into())).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_reports_ongoing_playback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let snapshot = PlaybackSnapshot {
            mode: Mode::Playing,
            track_id: Some("A".into()),
            anchor_time: Some(MonotonicClock::new().now_ms() - 10_000),
            paused_offset: None,
        };
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for round in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                host_playing_session(ws, round, snapshot.clone(), seen_tx.clone()).await;
            }
        });

        let mut config = DeviceConfig::new(url);
        config.resync_interval = None;
        let (device, player, mut events) = start_device(config);
        device.arm().unwrap();

        // First connection: the device starts playing and reports it
        let first = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match seen.recv().await {
                    Some((0, ClientMessage::ReportPlaybackFlag { playing, paused })) => {
                        break (playing, paused)
                    }
                    Some(_) => {}
                    None => panic!("server task ended"),
                }
            }
        })
        .await
        .expect("no flag on the first connection");
        assert_eq!(first, (true, false));
        wait_for_event(&mut events, |e| *e == DeviceEvent::Disconnected).await;

        // Second connection: the flag is announced right after the hello
        let after_hello = tokio::time::timeout(Duration::from_secs(5), async {
            let mut second = Vec::new();
            loop {
                match seen.recv().await {
                    Some((1, msg)) => {
                        let done = matches!(msg, ClientMessage::ReportPlaybackFlag { .. });
                        second.push(msg);
                        if done {
                            break second;
                        }
                    }
                    Some(_) => {}
                    None => panic!("server task ended"),
                }
            }
        })
        .await
        .expect("no flag on the second connection");
        assert_eq!(
            after_hello,
            vec![
                ClientMessage::Hello { role: Role::Player },
                ClientMessage::Armed,
                ClientMessage::ReportPlaybackFlag {
                    playing: true,
                    paused: false,
                },
            ]
        );

        // The unchanged snapshot did not restart the player
        let plays = player
            .calls()
            .iter()
            .filter(|c| matches!(c, PlayerInstruction::Play { .. }))
            .count();
        assert_eq!(plays, 1);
        device.shutdown();
    }

    #[tokio::test]
    async fn test_sync_while_disconnected_reports_closure() {
        // Nothing listens on this port any more
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (device, _player, mut events) = start_device(DeviceConfig::new(url));
        wait_for_event(&mut events, |e| matches!(e, DeviceEvent::Reconnecting { .. })).await;

        assert_eq!(device.begin_sync(10).await, Err(SyncError::SessionClosed));
        device.arm().unwrap();
        device.shutdown();
    }
}
