//! FFI types exposed via uniffi

use crate::catalog::TrackInfo;
use crate::sync::{Mode, PlaybackSnapshot, SessionInfo};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Not connected to a coordinator")]
    NotConnected,

    #[error("Already connected to a coordinator")]
    AlreadyConnected,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Clock sync failed: {0}")]
    SyncFailed(String),
}

/// Track information exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub duration_ms: i64,
    /// Local file name or URL of the audio
    pub asset: String,
}

impl From<&TrackInfo> for Track {
    fn from(t: &TrackInfo) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            duration_ms: t.duration_ms,
            asset: t.asset.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum PlaybackMode {
    Idle,
    /// Counting down to a future start
    Scheduled,
    Playing,
    Paused,
}

impl From<Mode> for PlaybackMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Idle => PlaybackMode::Idle,
            Mode::Scheduled => PlaybackMode::Scheduled,
            Mode::Playing => PlaybackMode::Playing,
            Mode::Paused => PlaybackMode::Paused,
        }
    }
}

/// Playback state exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct PlaybackState {
    pub mode: PlaybackMode,
    pub track_id: Option<String>,
    /// Reference time of in-track offset zero
    pub anchor_time: Option<i64>,
    pub paused_offset: Option<i64>,
}

impl From<&PlaybackSnapshot> for PlaybackState {
    fn from(s: &PlaybackSnapshot) -> Self {
        Self {
            mode: s.mode.into(),
            track_id: s.track_id.clone(),
            anchor_time: s.anchor_time,
            paused_offset: s.paused_offset,
        }
    }
}

/// A connected player, as listed to controllers
#[derive(Debug, Clone, uniffi::Record)]
pub struct SessionEntry {
    pub id: u64,
    pub name: Option<String>,
    pub armed: bool,
    pub playing: bool,
    pub paused: bool,
}

impl From<&SessionInfo> for SessionEntry {
    fn from(s: &SessionInfo) -> Self {
        Self {
            id: s.id,
            name: s.name.clone(),
            armed: s.armed,
            playing: s.playing,
            paused: s.paused,
        }
    }
}

/// Callback interface for device events. The playback methods are the
/// device's audio output and must return quickly.
#[uniffi::export(callback_interface)]
pub trait DeviceCallback: Send + Sync {
    /// Start `track` from the top when the local clock reads `local_time_ms`.
    /// The local clock is [`ParadeDevice::local_now_ms`](super::ParadeDevice::local_now_ms).
    fn play_at(&self, track: Track, local_time_ms: i64);
    /// Start `track` now, `offset_ms` into it
    fn play_from(&self, track: Track, offset_ms: i64);
    fn hold(&self, track: Track, offset_ms: i64);
    fn stop(&self);

    fn on_connected(&self);
    fn on_disconnected(&self);
    fn on_synced(&self, offset_ms: f64);
    fn on_state_changed(&self, state: PlaybackState);
    fn on_catalog(&self, tracks: Vec<Track>);
    /// Controllers only
    fn on_sessions_changed(&self, sessions: Vec<SessionEntry>);
    /// Controllers only
    fn on_playlist_changed(&self, playlist: Vec<String>, next_override: Option<String>);
    /// Controllers only
    fn on_track_ended(&self, track_id: String);
    fn on_terminated(&self);
    fn on_error(&self, message: String);
}
