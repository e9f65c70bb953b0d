//! Sync Protocol Messages
//!
//! JSON frames tagged by a camelCase `type` field.

use serde::{Deserialize, Serialize};

use crate::catalog::TrackInfo;

/// Role declared by a connection in its `hello`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Issues playback commands
    #[serde(alias = "admin")]
    Controller,
    /// Plays audio locally
    #[serde(alias = "client")]
    Player,
}

/// Playback mode as seen by clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    #[default]
    Idle,
    /// Playing with an anchor that may still be in the future
    Scheduled,
    Playing,
    Paused,
}

/// Full playback state pushed to every session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub mode: Mode,
    pub track_id: Option<String>,
    /// Reference time of in-track offset zero
    pub anchor_time: Option<i64>,
    /// In-track offset at the moment of pause
    pub paused_offset: Option<i64>,
}

/// A player session in the controller's listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: u64,
    pub name: Option<String>,
    pub armed: bool,
    pub playing: bool,
    pub paused: bool,
}

/// Messages sent by devices and controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    // === Handshake ===
    Hello { role: Role },

    // === Player reports ===
    RegisterName { name: String },
    Armed,
    ReportPlaybackFlag { playing: bool, paused: bool },

    // === Clock Synchronization ===
    Probe { send_time: i64 },

    // === Controller Commands ===
    CmdStart { track_id: String, delay_ms: i64 },
    CmdStop,
    CmdPause,
    CmdResume,
    CmdSeek {
        #[serde(default)]
        track_id: Option<String>,
        offset_ms: i64,
    },
    CmdSkip,
    CmdBack,
    CmdSetPlaylist { playlist: Vec<String> },
    CmdSetNextOverride { track_id: Option<String> },
    CmdKick { session_id: u64 },
}

impl ClientMessage {
    /// Check if this message may only come from a controller
    pub fn requires_controller(&self) -> bool {
        matches!(
            self,
            ClientMessage::CmdStart { .. }
                | ClientMessage::CmdStop
                | ClientMessage::CmdPause
                | ClientMessage::CmdResume
                | ClientMessage::CmdSeek { .. }
                | ClientMessage::CmdSkip
                | ClientMessage::CmdBack
                | ClientMessage::CmdSetPlaylist { .. }
                | ClientMessage::CmdSetNextOverride { .. }
                | ClientMessage::CmdKick { .. }
        )
    }

    /// Check if this message is a player's self-report
    pub fn requires_player(&self) -> bool {
        matches!(
            self,
            ClientMessage::RegisterName { .. }
                | ClientMessage::Armed
                | ClientMessage::ReportPlaybackFlag { .. }
        )
    }

    /// Wire name, used in logs and rejections
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::RegisterName { .. } => "registerName",
            ClientMessage::Armed => "armed",
            ClientMessage::ReportPlaybackFlag { .. } => "reportPlaybackFlag",
            ClientMessage::Probe { .. } => "probe",
            ClientMessage::CmdStart { .. } => "cmdStart",
            ClientMessage::CmdStop => "cmdStop",
            ClientMessage::CmdPause => "cmdPause",
            ClientMessage::CmdResume => "cmdResume",
            ClientMessage::CmdSeek { .. } => "cmdSeek",
            ClientMessage::CmdSkip => "cmdSkip",
            ClientMessage::CmdBack => "cmdBack",
            ClientMessage::CmdSetPlaylist { .. } => "cmdSetPlaylist",
            ClientMessage::CmdSetNextOverride { .. } => "cmdSetNextOverride",
            ClientMessage::CmdKick { .. } => "cmdKick",
        }
    }
}

/// Messages sent by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Answer to a probe, stamped with the reference clock on receipt
    ProbeReply { send_time: i64, reference_time: i64 },

    /// Full playback state (everyone)
    StateSnapshot(PlaybackSnapshot),

    /// Player listing (controllers only)
    SessionList { sessions: Vec<SessionInfo> },

    /// Every schedulable track
    TrackCatalog { tracks: Vec<TrackInfo> },

    /// Playlist order and pending override (controllers only)
    Playlist {
        playlist: Vec<String>,
        next_override: Option<String>,
    },

    /// A track reached its natural end (controllers only)
    TrackEnded { track_id: String },

    /// A command failed its preconditions (sender only)
    CommandRejected { command: String, reason: String },

    /// The session was kicked by a controller
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "cmdStart", "trackId": "A", "delayMs": 5000}))
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::CmdStart {
                track_id: "A".to_string(),
                delay_ms: 5000
            }
        );

        let msg: ClientMessage = serde_json::from_value(json!({"type": "armed"})).unwrap();
        assert_eq!(msg, ClientMessage::Armed);

        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "cmdSeek", "offsetMs": 1200})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::CmdSeek {
                track_id: None,
                offset_ms: 1200
            }
        );
    }

    #[test]
    fn test_legacy_role_names() {
        let admin: ClientMessage =
            serde_json::from_value(json!({"type": "hello", "role": "admin"})).unwrap();
        let client: ClientMessage =
            serde_json::from_value(json!({"type": "hello", "role": "client"})).unwrap();

        assert_eq!(admin, ClientMessage::Hello { role: Role::Controller });
        assert_eq!(client, ClientMessage::Hello { role: Role::Player });
    }

    #[test]
    fn test_state_snapshot_is_flat() {
        let msg = ServerMessage::StateSnapshot(PlaybackSnapshot {
            mode: Mode::Scheduled,
            track_id: Some("A".to_string()),
            anchor_time: Some(42),
            paused_offset: None,
        });

        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "stateSnapshot",
                "mode": "scheduled",
                "trackId": "A",
                "anchorTime": 42,
                "pausedOffset": null
            })
        );
    }

    #[test]
    fn test_probe_reply_fields() {
        let msg = ServerMessage::ProbeReply {
            send_time: 1,
            reference_time: 2,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "probeReply", "sendTime": 1, "referenceTime": 2})
        );
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "selfDestruct"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not even json").is_err());
    }

    #[test]
    fn test_permission_classes() {
        assert!(ClientMessage::CmdKick { session_id: 1 }.requires_controller());
        assert!(ClientMessage::CmdBack.requires_controller());
        assert!(!ClientMessage::Armed.requires_controller());
        assert!(ClientMessage::Armed.requires_player());
        assert!(!ClientMessage::Probe { send_time: 0 }.requires_player());
        assert!(!ClientMessage::Hello { role: Role::Player }.requires_controller());
    }
}
