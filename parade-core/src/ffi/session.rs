//! Device implementation for FFI

use std::sync::{Arc, Once};

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

use crate::clock::{Clock, MonotonicClock, DEFAULT_SAMPLE_COUNT, DEFAULT_SYNC_TIMEOUT};
use crate::device::{DeviceClient, DeviceConfig, DeviceHandle};
use crate::sync::{ClientMessage, Role};

use super::handlers::{handle_device_event, CallbackPlayer, SharedCallback};
use super::types::*;

static TRACING_INIT: Once = Once::new();

/// A playback device (or controller) connected to a coordinator
#[derive(uniffi::Object)]
pub struct ParadeDevice {
    runtime: Runtime,
    /// Local clock behind `play_at` times; kept across reconnects
    clock: Arc<MonotonicClock>,
    callback: SharedCallback,
    handle: RwLock<Option<DeviceHandle>>,
}

#[uniffi::export]
impl ParadeDevice {
    /// Create a new, disconnected device
    #[uniffi::constructor]
    pub fn new() -> Self {
        // Initialize tracing once
        TRACING_INIT.call_once(|| {
            let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "parade_core=debug"
                    .parse()
                    .unwrap_or_else(|_| LevelFilter::DEBUG.into()),
            );
            let _ = tracing_subscriber::fmt()
                .with_ansi(false)
                .with_target(false)
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        });

        info!("Initializing parade device");

        let runtime = Runtime::new().expect("Failed to create tokio runtime");

        Self {
            runtime,
            clock: Arc::new(MonotonicClock::new()),
            callback: Arc::new(RwLock::new(None)),
            handle: RwLock::new(None),
        }
    }

    /// Set the event callback (also the audio output)
    pub fn set_callback(&self, callback: Box<dyn DeviceCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Connect to the coordinator at `url`. Reconnects automatically until
    /// [`disconnect`](Self::disconnect) is called.
    pub fn connect(&self, url: String, display_name: Option<String>, controller: bool) -> Result<(), CoreError> {
        if url.trim().is_empty() {
            return Err(CoreError::NetworkError("Empty coordinator URL".to_string()));
        }

        let mut handle = self.handle.write();
        if handle.is_some() {
            return Err(CoreError::AlreadyConnected);
        }

        let mut config = DeviceConfig::new(url);
        config.display_name = display_name;
        config.role = if controller { Role::Controller } else { Role::Player };
        info!("Connecting to {} as {:?}", config.url, config.role);

        let _guard = self.runtime.enter();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let client = DeviceClient::new(
            config,
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            Arc::new(CallbackPlayer::new(Arc::clone(&self.callback))),
        )
        .with_events(events_tx);
        *handle = Some(client.start());

        let callback = Arc::clone(&self.callback);
        self.runtime.spawn(async move {
            while let Some(event) = events_rx.recv().await {
                handle_device_event(event, &callback);
            }
        });

        Ok(())
    }

    /// Close the connection and stop reconnecting
    pub fn disconnect(&self) {
        if let Some(handle) = self.handle.write().take() {
            info!("Disconnecting");
            handle.shutdown();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Set the name shown to controllers
    pub fn register_name(&self, name: String) -> Result<(), CoreError> {
        self.device()?
            .register_name(&name)
            .map_err(|e| CoreError::NetworkError(e.to_string()))
    }

    /// Declare local audio ready (after the user's consent gesture)
    pub fn arm(&self) -> Result<(), CoreError> {
        self.device()?
            .arm()
            .map_err(|e| CoreError::NetworkError(e.to_string()))
    }

    /// Re-run the clock offset estimator. Blocks until it converges.
    pub fn resync(&self) -> Result<f64, CoreError> {
        let device = self.device()?;
        self.runtime
            .block_on(device.sync_with_timeout(DEFAULT_SAMPLE_COUNT, DEFAULT_SYNC_TIMEOUT))
            .map_err(|e| CoreError::SyncFailed(e.to_string()))
    }

    /// Local clock reading, the time base of [`DeviceCallback::play_at`]
    pub fn local_now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Reference time now, if synced
    pub fn now_ms(&self) -> Option<i64> {
        self.handle.read().as_ref().and_then(|h| h.now())
    }

    pub fn offset_ms(&self) -> Option<f64> {
        self.handle.read().as_ref().and_then(|h| h.offset_ms())
    }

    pub fn playback_state(&self) -> Option<PlaybackState> {
        self.handle
            .read()
            .as_ref()
            .and_then(|h| h.snapshot())
            .map(|s| PlaybackState::from(&s))
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.handle
            .read()
            .as_ref()
            .map(|h| h.tracks().iter().map(Track::from).collect())
            .unwrap_or_default()
    }

    // === Controller commands ===

    pub fn start_track(&self, track_id: String, delay_ms: i64) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdStart { track_id, delay_ms })
    }

    pub fn stop_playback(&self) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdStop)
    }

    pub fn pause(&self) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdPause)
    }

    pub fn resume(&self) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdResume)
    }

    pub fn seek(&self, offset_ms: i64, track_id: Option<String>) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdSeek { track_id, offset_ms })
    }

    pub fn skip(&self) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdSkip)
    }

    pub fn back(&self) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdBack)
    }

    pub fn set_playlist(&self, playlist: Vec<String>) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdSetPlaylist { playlist })
    }

    pub fn set_next_override(&self, track_id: Option<String>) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdSetNextOverride { track_id })
    }

    pub fn kick(&self, session_id: u64) -> Result<(), CoreError> {
        self.command(ClientMessage::CmdKick { session_id })
    }
}

impl ParadeDevice {
    fn device(&self) -> Result<DeviceHandle, CoreError> {
        self.handle.read().clone().ok_or(CoreError::NotConnected)
    }

    fn command(&self, message: ClientMessage) -> Result<(), CoreError> {
        self.device()?
            .send(message)
            .map_err(|e| CoreError::NetworkError(e.to_string()))
    }
}

impl Default for ParadeDevice {
    fn default() -> Self {
        Self::new()
    }
}
