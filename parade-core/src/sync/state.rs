//! Playback State Machine
//!
//! The single authoritative record of what should be playing and since
//! when. All times are reference-clock milliseconds supplied by the caller,
//! which keeps every transition a pure function of (state, command, now).

use std::sync::Arc;

use thiserror::Error;

use super::protocol::{Mode, PlaybackSnapshot};
use crate::catalog::TrackCatalog;

/// Default window after which `back` restarts the current track
pub const DEFAULT_BACK_THRESHOLD_MS: i64 = 5_000;

/// Precondition failures. A rejected command leaves the state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Start delay must be positive (got {0}ms)")]
    NonPositiveDelay(i64),

    #[error("Unknown track: {0}")]
    UnknownTrack(String),

    #[error("Nothing is playing")]
    NotPlaying,

    #[error("Playback is not paused")]
    NotPaused,

    #[error("No track is loaded")]
    Idle,

    #[error("Seek offset must not be negative (got {0}ms)")]
    NegativeOffset(i64),

    #[error("No next track in the playlist")]
    NoNextTrack,

    #[error("Start delay is out of range (got {0}ms)")]
    DelayTooLarge(i64),

    #[error("Seek offset is out of range (got {0}ms)")]
    OffsetTooLarge(i64),
}

/// Current playback state. Each variant carries exactly the fields that
/// are meaningful in that mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    /// Started with a delay; clients count down until the anchor passes
    Scheduled { track_id: String, anchor_time: i64 },
    Playing { track_id: String, anchor_time: i64 },
    Paused { track_id: String, paused_offset: i64 },
}

impl PlaybackState {
    pub fn mode(&self) -> Mode {
        match self {
            PlaybackState::Idle => Mode::Idle,
            PlaybackState::Scheduled { .. } => Mode::Scheduled,
            PlaybackState::Playing { .. } => Mode::Playing,
            PlaybackState::Paused { .. } => Mode::Paused,
        }
    }

    pub fn track_id(&self) -> Option<&str> {
        match self {
            PlaybackState::Idle => None,
            PlaybackState::Scheduled { track_id, .. }
            | PlaybackState::Playing { track_id, .. }
            | PlaybackState::Paused { track_id, .. } => Some(track_id),
        }
    }

    pub fn anchor_time(&self) -> Option<i64> {
        match self {
            PlaybackState::Scheduled { anchor_time, .. }
            | PlaybackState::Playing { anchor_time, .. } => Some(*anchor_time),
            _ => None,
        }
    }

    pub fn paused_offset(&self) -> Option<i64> {
        match self {
            PlaybackState::Paused { paused_offset, .. } => Some(*paused_offset),
            _ => None,
        }
    }

    /// In-track position at `now` (negative while a scheduled start is
    /// still ahead)
    pub fn position_at(&self, now: i64) -> Option<i64> {
        match self {
            PlaybackState::Idle => None,
            PlaybackState::Scheduled { anchor_time, .. }
            | PlaybackState::Playing { anchor_time, .. } => Some(now.saturating_sub(*anchor_time)),
            PlaybackState::Paused { paused_offset, .. } => Some(*paused_offset),
        }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            mode: self.mode(),
            track_id: self.track_id().map(str::to_string),
            anchor_time: self.anchor_time(),
            paused_offset: self.paused_offset(),
        }
    }
}

/// Owns the playback state plus the playlist it advances through.
pub struct PlaybackMachine {
    state: PlaybackState,
    playlist: Vec<String>,
    /// One-shot replacement for the next playlist track
    next_override: Option<String>,
    catalog: Arc<dyn TrackCatalog>,
    back_threshold_ms: i64,
}

impl PlaybackMachine {
    pub fn new(catalog: Arc<dyn TrackCatalog>, back_threshold_ms: i64) -> Self {
        Self {
            state: PlaybackState::Idle,
            playlist: Vec::new(),
            next_override: None,
            catalog,
            back_threshold_ms,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.state.snapshot()
    }

    pub fn playlist(&self) -> &[String] {
        &self.playlist
    }

    pub fn next_override(&self) -> Option<&str> {
        self.next_override.as_deref()
    }

    /// Duration of the loaded track
    pub fn current_duration_ms(&self) -> Option<i64> {
        self.state
            .track_id()
            .and_then(|id| self.catalog.duration_ms(id))
    }

    /// Reference time at which the loaded track should auto-advance, i.e.
    /// `epsilon_ms` before its natural end. None unless running.
    pub fn auto_advance_at(&self, epsilon_ms: i64) -> Option<i64> {
        let anchor = self.state.anchor_time()?;
        let duration = self.current_duration_ms()?;
        Some(anchor.saturating_add(duration).saturating_sub(epsilon_ms))
    }

    // === Playlist ===

    /// Replace the playlist. Every id must exist in the catalog.
    pub fn set_playlist(&mut self, playlist: Vec<String>) -> Result<(), CommandError> {
        if let Some(unknown) = playlist.iter().find(|id| !self.catalog.contains(id)) {
            return Err(CommandError::UnknownTrack(unknown.clone()));
        }
        self.playlist = playlist;
        Ok(())
    }

    /// Set or clear the one-shot next-track override
    pub fn set_next_override(&mut self, track_id: Option<String>) -> Result<(), CommandError> {
        if let Some(id) = &track_id {
            self.require_track(id)?;
        }
        self.next_override = track_id;
        Ok(())
    }

    // === Primitive transitions ===

    /// Schedule `track_id` to start `delay_ms` from now
    pub fn start(&mut self, track_id: &str, delay_ms: i64, now: i64) -> Result<(), CommandError> {
        if delay_ms <= 0 {
            return Err(CommandError::NonPositiveDelay(delay_ms));
        }
        self.require_track(track_id)?;

        // The anchor and the track's end must both be representable
        let duration = self.catalog.duration_ms(track_id).unwrap_or(0);
        now.checked_add(delay_ms)
            .and_then(|anchor| anchor.checked_add(duration))
            .ok_or(CommandError::DelayTooLarge(delay_ms))?;

        self.begin(track_id.to_string(), delay_ms, now);
        Ok(())
    }

    pub fn pause(&mut self, now: i64) -> Result<(), CommandError> {
        let (track_id, anchor_time) = match &self.state {
            PlaybackState::Scheduled { track_id, anchor_time }
            | PlaybackState::Playing { track_id, anchor_time } => (track_id.clone(), *anchor_time),
            _ => return Err(CommandError::NotPlaying),
        };

        let duration = self.catalog.duration_ms(&track_id).unwrap_or(i64::MAX);
        let paused_offset = now.saturating_sub(anchor_time).clamp(0, duration);
        self.state = PlaybackState::Paused {
            track_id,
            paused_offset,
        };
        Ok(())
    }

    pub fn resume(&mut self, now: i64) -> Result<(), CommandError> {
        let PlaybackState::Paused { track_id, paused_offset } = &self.state else {
            return Err(CommandError::NotPaused);
        };

        self.state = PlaybackState::Playing {
            track_id: track_id.clone(),
            anchor_time: now - paused_offset,
        };
        Ok(())
    }

    /// Jump to `offset_ms`, optionally switching track first
    pub fn seek(
        &mut self,
        offset_ms: i64,
        track_id: Option<&str>,
        now: i64,
    ) -> Result<(), CommandError> {
        if offset_ms < 0 {
            return Err(CommandError::NegativeOffset(offset_ms));
        }
        let current = self.state.track_id().ok_or(CommandError::Idle)?;
        let anchor_time = now
            .checked_sub(offset_ms)
            .ok_or(CommandError::OffsetTooLarge(offset_ms))?;
        let track_id = match track_id {
            Some(id) => {
                self.require_track(id)?;
                id.to_string()
            }
            None => current.to_string(),
        };

        self.state = PlaybackState::Playing { track_id, anchor_time };
        Ok(())
    }

    pub fn stop(&mut self) {
        self.state = PlaybackState::Idle;
    }

    // === Computed transitions ===

    /// Restart the current track if it has been running longer than the
    /// back threshold, otherwise go to the previous playlist track.
    pub fn back(&mut self, now: i64) -> Result<(), CommandError> {
        let elapsed = self.state.position_at(now).ok_or(CommandError::Idle)?;

        if elapsed > self.back_threshold_ms {
            return self.seek(0, None, now);
        }

        match self.previous_track_id() {
            Some(previous) => {
                self.begin(previous, 0, now);
                Ok(())
            }
            // Nothing to go back to
            None => self.seek(0, None, now),
        }
    }

    /// Jump to the next track right away
    pub fn skip(&mut self, now: i64) -> Result<(), CommandError> {
        let next = self.next_track_id().ok_or(CommandError::NoNextTrack)?;
        self.begin(next, 0, now);
        Ok(())
    }

    /// Natural end of the current track. Starts the next one, or stops
    /// when there is nothing to play. Returns the new track.
    pub fn advance(&mut self, now: i64) -> Option<String> {
        match self.next_track_id() {
            Some(next) => {
                self.begin(next.clone(), 0, now);
                Some(next)
            }
            None => {
                self.stop();
                None
            }
        }
    }

    // === Helpers ===

    fn begin(&mut self, track_id: String, delay_ms: i64, now: i64) {
        self.state = PlaybackState::Scheduled {
            track_id,
            anchor_time: now + delay_ms,
        };
    }

    fn require_track(&self, id: &str) -> Result<(), CommandError> {
        if self.catalog.contains(id) {
            Ok(())
        } else {
            Err(CommandError::UnknownTrack(id.to_string()))
        }
    }

    /// Next track in playlist order (wrapping), consuming the override
    fn next_track_id(&mut self) -> Option<String> {
        if let Some(id) = self.next_override.take() {
            return Some(id);
        }
        if self.playlist.is_empty() {
            return None;
        }

        let next = match self.current_index() {
            Some(idx) => (idx + 1) % self.playlist.len(),
            None => 0,
        };
        Some(self.playlist[next].clone())
    }

    /// Previous track in playlist order, wrapping to the last one
    fn previous_track_id(&self) -> Option<String> {
        let last = self.playlist.len().checked_sub(1)?;
        let previous = match self.current_index() {
            Some(idx) if idx > 0 => idx - 1,
            _ => last,
        };
        Some(self.playlist[previous].clone())
    }

    fn current_index(&self) -> Option<usize> {
        let current = self.state.track_id()?;
        self.playlist.iter().position(|id| id == current)
    }
}
