//! Device event handlers and the callback-backed player

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::catalog::TrackInfo;
use crate::device::{DeviceEvent, LocalPlayer, PlaybackStart};

use super::types::{DeviceCallback, PlaybackState, SessionEntry, Track};

pub(super) type SharedCallback = Arc<RwLock<Option<Arc<dyn DeviceCallback>>>>;

fn current(callback: &SharedCallback) -> Option<Arc<dyn DeviceCallback>> {
    callback.read().clone()
}

/// Local audio primitive implemented by the native app
pub(super) struct CallbackPlayer {
    callback: SharedCallback,
}

impl CallbackPlayer {
    pub(super) fn new(callback: SharedCallback) -> Self {
        Self { callback }
    }
}

impl LocalPlayer for CallbackPlayer {
    fn play(&self, track: &TrackInfo, start: PlaybackStart) {
        let Some(cb) = current(&self.callback) else {
            debug!("No callback registered, dropping play of {}", track.id);
            return;
        };
        match start {
            PlaybackStart::AtLocalTime(at) => cb.play_at(Track::from(track), at),
            PlaybackStart::ImmediateOffset(offset) => cb.play_from(Track::from(track), offset),
        }
    }

    fn hold(&self, track: &TrackInfo, offset_ms: i64) {
        if let Some(cb) = current(&self.callback) {
            cb.hold(Track::from(track), offset_ms);
        }
    }

    fn stop(&self) {
        if let Some(cb) = current(&self.callback) {
            cb.stop();
        }
    }
}

/// Forward a device event to the native callback
pub(super) fn handle_device_event(event: DeviceEvent, callback: &SharedCallback) {
    let Some(cb) = current(callback) else {
        return;
    };

    match event {
        DeviceEvent::Connected => cb.on_connected(),
        DeviceEvent::Disconnected => cb.on_disconnected(),
        DeviceEvent::Reconnecting { attempt, delay } => {
            debug!("Reconnect attempt {} in {:?}", attempt, delay);
        }
        DeviceEvent::Synced { offset_ms } => cb.on_synced(offset_ms),
        DeviceEvent::SyncFailed { reason } => cb.on_error(reason),
        DeviceEvent::Catalog { tracks } => {
            cb.on_catalog(tracks.iter().map(Track::from).collect());
        }
        DeviceEvent::StateChanged { snapshot } => {
            cb.on_state_changed(PlaybackState::from(&snapshot));
        }
        DeviceEvent::Blocked { reason } => {
            debug!("Playback change deferred: {:?}", reason);
        }
        DeviceEvent::Sessions { sessions } => {
            cb.on_sessions_changed(sessions.iter().map(SessionEntry::from).collect());
        }
        DeviceEvent::Playlist {
            playlist,
            next_override,
        } => cb.on_playlist_changed(playlist, next_override),
        DeviceEvent::TrackEnded { track_id } => cb.on_track_ended(track_id),
        DeviceEvent::CommandRejected { command, reason } => {
            cb.on_error(format!("{} rejected: {}", command, reason));
        }
        DeviceEvent::Terminated => cb.on_terminated(),
    }
}
