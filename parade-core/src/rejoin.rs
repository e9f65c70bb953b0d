//! Rejoin Resolver
//!
//! Turns a playback snapshot plus the synced reference time into the local
//! action a device should take right now. Used for the first snapshot
//! after joining (possibly mid-track) as well as every later one.

use crate::sync::{Mode, PlaybackSnapshot};

/// What local playback should be doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalAction {
    /// Nothing loaded
    Silence,
    /// Start the track from zero after `delay_ms`
    StartIn { track_id: String, delay_ms: i64 },
    /// Start the track immediately, `offset_ms` into it
    StartAt { track_id: String, offset_ms: i64 },
    /// Track loaded but paused at `offset_ms`
    Hold { track_id: String, offset_ms: i64 },
}

impl LocalAction {
    pub fn track_id(&self) -> Option<&str> {
        match self {
            LocalAction::Silence => None,
            LocalAction::StartIn { track_id, .. }
            | LocalAction::StartAt { track_id, .. }
            | LocalAction::Hold { track_id, .. } => Some(track_id),
        }
    }
}

/// Resolve `snapshot` at reference time `shared_now`.
///
/// `duration_ms` bounds the mid-track offset; a late join past the end
/// lands on the last millisecond instead of beyond it.
pub fn resolve(snapshot: &PlaybackSnapshot, shared_now: i64, duration_ms: Option<i64>) -> LocalAction {
    let Some(track_id) = snapshot.track_id.clone() else {
        return LocalAction::Silence;
    };

    match snapshot.mode {
        Mode::Idle => LocalAction::Silence,
        Mode::Scheduled | Mode::Playing => {
            let Some(anchor_time) = snapshot.anchor_time else {
                return LocalAction::Silence;
            };
            let delta = shared_now.saturating_sub(anchor_time);
            if delta < 0 {
                LocalAction::StartIn {
                    track_id,
                    delay_ms: delta.saturating_neg(),
                }
            } else {
                LocalAction::StartAt {
                    track_id,
                    offset_ms: clamp_offset(delta, duration_ms),
                }
            }
        }
        Mode::Paused => LocalAction::Hold {
            track_id,
            offset_ms: clamp_offset(snapshot.paused_offset.unwrap_or(0), duration_ms),
        },
    }
}

fn clamp_offset(offset_ms: i64, duration_ms: Option<i64>) -> i64 {
    match duration_ms {
        Some(duration) if duration > 0 => offset_ms.clamp(0, duration - 1),
        _ => offset_ms.max(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(mode: Mode, anchor_time: i64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            mode,
            track_id: Some("A".to_string()),
            anchor_time: Some(anchor_time),
            paused_offset: None,
        }
    }

    #[test]
    fn test_late_join_starts_mid_track() {
        let now = 1_000_000;
        let snapshot = running(Mode::Playing, now - 30_000);
        assert_eq!(
            resolve(&snapshot, now, Some(180_000)),
            LocalAction::StartAt {
                track_id: "A".into(),
                offset_ms: 30_000
            }
        );
    }

    #[test]
    fn test_future_anchor_counts_down() {
        let snapshot = running(Mode::Scheduled, 10_000);
        assert_eq!(
            resolve(&snapshot, 7_500, Some(60_000)),
            LocalAction::StartIn {
                track_id: "A".into(),
                delay_ms: 2_500
            }
        );
    }

    #[test]
    fn test_scheduled_past_anchor_behaves_like_playing() {
        let now = 50_000;
        assert_eq!(
            resolve(&running(Mode::Scheduled, 40_000), now, Some(60_000)),
            resolve(&running(Mode::Playing, 40_000), now, Some(60_000)),
        );
    }

    #[test]
    fn test_extreme_anchors_saturate() {
        assert_eq!(
            resolve(&running(Mode::Scheduled, i64::MAX), -5_000, Some(60_000)),
            LocalAction::StartIn {
                track_id: "A".into(),
                delay_ms: i64::MAX
            }
        );
        assert_eq!(
            resolve(&running(Mode::Playing, i64::MIN), 5_000, Some(60_000)),
            LocalAction::StartAt {
                track_id: "A".into(),
                offset_ms: 59_999
            }
        );
    }

    #[test]
    fn test_anchor_exactly_now_starts_at_zero() {
        assert_eq!(
            resolve(&running(Mode::Scheduled, 5_000), 5_000, Some(60_000)),
            LocalAction::StartAt {
                track_id: "A".into(),
                offset_ms: 0
            }
        );
    }

    #[test]
    fn test_paused_holds_position() {
        let snapshot = PlaybackSnapshot {
            mode: Mode::Paused,
            track_id: Some("B".to_string()),
            anchor_time: None,
            paused_offset: Some(12_345),
        };
        assert_eq!(
            resolve(&snapshot, 99_999, Some(60_000)),
            LocalAction::Hold {
                track_id: "B".into(),
                offset_ms: 12_345
            }
        );
    }

    #[test]
    fn test_idle_is_silence() {
        assert_eq!(resolve(&PlaybackSnapshot::default(), 0, None), LocalAction::Silence);
    }

    #[test]
    fn test_past_end_is_clamped() {
        let snapshot = running(Mode::Playing, 0);
        assert_eq!(
            resolve(&snapshot, 10_000, Some(3_000)),
            LocalAction::StartAt {
                track_id: "A".into(),
                offset_ms: 2_999
            }
        );
        // Unknown duration: no upper clamp
        assert_eq!(
            resolve(&snapshot, 10_000, None),
            LocalAction::StartAt {
                track_id: "A".into(),
                offset_ms: 10_000
            }
        );
    }

    #[test]
    fn test_resolving_later_moves_by_elapsed_time() {
        let snapshot = running(Mode::Playing, 1_000);
        let first = resolve(&snapshot, 5_000, Some(60_000));
        let second = resolve(&snapshot, 5_750, Some(60_000));
        match (first, second) {
            (
                LocalAction::StartAt { offset_ms: a, .. },
                LocalAction::StartAt { offset_ms: b, .. },
            ) => assert_eq!(b - a, 750),
            other => panic!("unexpected actions: {:?}", other),
        }

        let scheduled = running(Mode::Scheduled, 9_000);
        let first = resolve(&scheduled, 5_000, Some(60_000));
        let second = resolve(&scheduled, 6_000, Some(60_000));
        match (first, second) {
            (
                LocalAction::StartIn { delay_ms: a, .. },
                LocalAction::StartIn { delay_ms: b, .. },
            ) => assert_eq!(a - b, 1_000),
            other => panic!("unexpected actions: {:?}", other),
        }
    }
}
