//! Device-side playback state
//!
//! Everything a device knows about the session: its clock offset, the
//! catalog, the latest snapshot and what it last told the local player to
//! do. [`DeviceState::reconcile`] is the only place that decides whether
//! local playback must change.

use std::collections::HashMap;

use super::PlaybackStart;
use crate::catalog::TrackInfo;
use crate::clock::OffsetEstimator;
use crate::rejoin::{self, LocalAction};
use crate::sync::{Mode, PlaybackSnapshot};

/// Identity of an applied action. Two snapshots with the same key must not
/// restart playback.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum ActionKey {
    #[default]
    Silent,
    /// Scheduled and playing share a key: the countdown collapsing into
    /// playback is not a new start
    Running { track_id: String, anchor_time: i64 },
    Held { track_id: String, paused_offset: i64 },
}

impl ActionKey {
    fn of(snapshot: &PlaybackSnapshot) -> Self {
        match (snapshot.mode, &snapshot.track_id) {
            (Mode::Scheduled | Mode::Playing, Some(track_id)) => ActionKey::Running {
                track_id: track_id.clone(),
                anchor_time: snapshot.anchor_time.unwrap_or_default(),
            },
            (Mode::Paused, Some(track_id)) => ActionKey::Held {
                track_id: track_id.clone(),
                paused_offset: snapshot.paused_offset.unwrap_or_default(),
            },
            _ => ActionKey::Silent,
        }
    }

    /// (playing, paused) while this action is applied
    fn playback_flag(&self) -> (bool, bool) {
        match self {
            ActionKey::Silent => (false, false),
            ActionKey::Running { .. } => (true, false),
            ActionKey::Held { .. } => (false, true),
        }
    }
}

/// A change to apply to the local player
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerInstruction {
    Play { track: TrackInfo, start: PlaybackStart },
    Hold { track: TrackInfo, offset_ms: i64 },
    Stop,
}

impl PlayerInstruction {
    /// (playing, paused) as reported to the coordinator
    pub fn playback_flag(&self) -> (bool, bool) {
        match self {
            PlayerInstruction::Play { .. } => (true, false),
            PlayerInstruction::Hold { .. } => (false, true),
            PlayerInstruction::Stop => (false, false),
        }
    }
}

/// Why a snapshot could not be applied yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    NotArmed,
    NotSynced,
    NoSnapshot,
    UnknownTrack,
}

#[derive(Debug, Default)]
pub struct DeviceState {
    estimator: OffsetEstimator,
    catalog: HashMap<String, TrackInfo>,
    snapshot: Option<PlaybackSnapshot>,
    display_name: Option<String>,
    armed: bool,
    applied: ActionKey,
    reported_flag: Option<(bool, bool)>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn estimator(&self) -> &OffsetEstimator {
        &self.estimator
    }

    pub fn estimator_mut(&mut self) -> &mut OffsetEstimator {
        &mut self.estimator
    }

    /// Reference time at `local_now`, None before the first sync
    pub fn shared_now(&self, local_now: i64) -> Option<i64> {
        self.estimator.now(local_now)
    }

    pub fn set_catalog(&mut self, tracks: Vec<TrackInfo>) {
        self.catalog = tracks.into_iter().map(|t| (t.id.clone(), t)).collect();
    }

    pub fn track(&self, id: &str) -> Option<&TrackInfo> {
        self.catalog.get(id)
    }

    pub fn tracks(&self) -> Vec<TrackInfo> {
        let mut tracks: Vec<TrackInfo> = self.catalog.values().cloned().collect();
        tracks.sort_by(|a, b| a.id.cmp(&b.id));
        tracks
    }

    pub fn set_snapshot(&mut self, snapshot: PlaybackSnapshot) {
        self.snapshot = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<&PlaybackSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn set_display_name(&mut self, name: Option<String>) {
        self.display_name = name;
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// What the local player should do right now, if anything changed
    /// since the last applied instruction.
    pub fn reconcile(&mut self, local_now: i64) -> Result<Option<PlayerInstruction>, Blocked> {
        if !self.armed {
            return Err(Blocked::NotArmed);
        }
        let shared_now = self.shared_now(local_now).ok_or(Blocked::NotSynced)?;
        let snapshot = self.snapshot.as_ref().ok_or(Blocked::NoSnapshot)?;

        let key = ActionKey::of(snapshot);
        if key == self.applied {
            return Ok(None);
        }

        let duration = snapshot
            .track_id
            .as_deref()
            .and_then(|id| self.catalog.get(id))
            .map(|t| t.duration_ms);

        let instruction = match rejoin::resolve(snapshot, shared_now, duration) {
            LocalAction::Silence => PlayerInstruction::Stop,
            LocalAction::StartIn { track_id, delay_ms } => PlayerInstruction::Play {
                track: self.lookup(&track_id)?,
                start: PlaybackStart::AtLocalTime(local_now.saturating_add(delay_ms)),
            },
            LocalAction::StartAt { track_id, offset_ms } => PlayerInstruction::Play {
                track: self.lookup(&track_id)?,
                start: PlaybackStart::ImmediateOffset(offset_ms),
            },
            LocalAction::Hold { track_id, offset_ms } => PlayerInstruction::Hold {
                track: self.lookup(&track_id)?,
                offset_ms,
            },
        };

        self.applied = key;
        Ok(Some(instruction))
    }

    /// Returns the flag to report if it differs from the last report
    pub fn take_flag_report(&mut self, instruction: &PlayerInstruction) -> Option<(bool, bool)> {
        let flag = instruction.playback_flag();
        if self.reported_flag == Some(flag) {
            return None;
        }
        self.reported_flag = Some(flag);
        Some(flag)
    }

    /// Forget the reported flag once the coordinator session is gone
    pub fn reset_reports(&mut self) {
        self.reported_flag = None;
    }

    /// Flag to announce on a fresh coordinator session. The session starts
    /// out neither playing nor paused, and an unchanged snapshot produces no
    /// new instruction, so whatever is already applied must be reported
    /// here.
    pub fn flag_for_new_session(&mut self) -> Option<(bool, bool)> {
        let flag = self.applied.playback_flag();
        self.reported_flag = Some(flag);
        (flag != (false, false)).then_some(flag)
    }

    fn lookup(&self, track_id: &str) -> Result<TrackInfo, Blocked> {
        self.catalog.get(track_id).cloned().ok_or(Blocked::UnknownTrack)
    }
}
