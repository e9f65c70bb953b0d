//! Device Client
//!
//! Connects a playback device (or a controller) to the coordinator, keeps
//! its clock offset fresh and drives a [`LocalPlayer`] from the snapshots
//! it receives.

mod backoff;
mod client;
mod state;

pub use client::{DeviceClient, DeviceHandle};
pub use state::{Blocked, DeviceState, PlayerInstruction};

use std::time::Duration;

use thiserror::Error;

use crate::catalog::TrackInfo;
use crate::clock::{SyncError, DEFAULT_SAMPLE_COUNT, DEFAULT_SYNC_TIMEOUT};
use crate::sync::{PlaybackSnapshot, Role, SessionInfo};

/// Default interval between background resyncs
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// How local playback should begin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStart {
    /// From the top of the track when the local clock reads this value
    AtLocalTime(i64),
    /// Right now, this far into the track
    ImmediateOffset(i64),
}

/// The device's audio output. Implementations must return quickly; the
/// client calls them from its own task.
pub trait LocalPlayer: Send + Sync {
    fn play(&self, track: &TrackInfo, start: PlaybackStart);
    fn hold(&self, track: &TrackInfo, offset_ms: i64);
    fn stop(&self);
}

/// Device client settings
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Coordinator WebSocket URL
    pub url: String,
    pub role: Role,
    pub display_name: Option<String>,
    /// Probes per sync run
    pub sample_count: usize,
    /// A sync run that has not converged by then is abandoned
    pub sync_timeout: Duration,
    /// Background resync interval (None disables it)
    pub resync_interval: Option<Duration>,
    pub reconnect: bool,
}

impl DeviceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            role: Role::Player,
            display_name: None,
            sample_count: DEFAULT_SAMPLE_COUNT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            resync_interval: Some(DEFAULT_RESYNC_INTERVAL),
            reconnect: true,
        }
    }
}

/// Events emitted by the device client
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    Synced { offset_ms: f64 },
    SyncFailed { reason: String },
    Catalog { tracks: Vec<TrackInfo> },
    StateChanged { snapshot: PlaybackSnapshot },
    /// A snapshot arrived that cannot be applied yet
    Blocked { reason: Blocked },
    Sessions { sessions: Vec<SessionInfo> },
    Playlist { playlist: Vec<String>, next_override: Option<String> },
    TrackEnded { track_id: String },
    CommandRejected { command: String, reason: String },
    /// Kicked by a controller; the client will not reconnect
    Terminated,
}

/// Device client errors
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Device client closed")]
    Closed,

    #[error("Clock sync failed: {0}")]
    Sync(#[from] SyncError),
}
