//! Metrics tracking for the coordination server

use chrono::{DateTime, Local};
use parade_core::service::ServiceEvent;
use parade_core::sync::{Mode, PlaybackSnapshot, Role};
use std::collections::VecDeque;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Playback,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Playback => "PLAY",
        }
    }
}

/// Server metrics
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// Address the WebSocket listener is bound to
    pub bind_addr: Option<String>,

    /// Tracks in the catalog
    pub catalog_size: usize,

    /// Declared players
    pub players: usize,

    /// Declared controllers
    pub controllers: usize,

    /// Players that have armed their audio
    pub armed: usize,

    /// Total role declarations since start
    pub total_connections: u64,

    /// Peak simultaneous declared connections
    pub peak_connections: usize,

    /// Latest authoritative playback state
    pub playback: PlaybackSnapshot,

    /// Commands applied since start
    pub commands_applied: u64,

    /// Commands rejected since start
    pub commands_rejected: u64,

    /// Auto-advances since start
    pub auto_advances: u64,

    /// Sessions kicked by a controller
    pub kicks: u64,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Server status
    pub status: ServerStatus,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            bind_addr: None,
            catalog_size: 0,
            players: 0,
            controllers: 0,
            armed: 0,
            total_connections: 0,
            peak_connections: 0,
            playback: PlaybackSnapshot::default(),
            commands_applied: 0,
            commands_rejected: 0,
            auto_advances: 0,
            kicks: 0,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Fold a coordinator event into the counters and the log
    pub fn record(&mut self, event: &ServiceEvent) {
        match event {
            ServiceEvent::Joined {
                conn,
                role,
                session_id,
            } => {
                self.total_connections += 1;
                let who = match (role, session_id) {
                    (Role::Player, Some(id)) => format!("player #{}", id),
                    (Role::Player, None) => "player".to_string(),
                    (Role::Controller, _) => "controller".to_string(),
                };
                self.log(LogLevel::Connection, format!("Joined: {} ({})", who, conn));
            }
            ServiceEvent::Left {
                conn,
                role,
                session_id,
            } => {
                let message = match (role, session_id) {
                    (Some(Role::Player), Some(id)) => format!("Left: player #{} ({})", id, conn),
                    (Some(Role::Controller), _) => format!("Left: controller ({})", conn),
                    _ => format!("Closed: {}", conn),
                };
                self.log(LogLevel::Connection, message);
            }
            ServiceEvent::SessionsChanged {
                players,
                controllers,
                armed,
            } => {
                self.players = *players;
                self.controllers = *controllers;
                self.armed = *armed;
                self.peak_connections = self.peak_connections.max(players + controllers);
            }
            ServiceEvent::StateChanged { snapshot } => {
                self.playback = snapshot.clone();
            }
            ServiceEvent::CommandApplied { command } => {
                self.commands_applied += 1;
                self.log(LogLevel::Playback, format!("{} applied", command));
            }
            ServiceEvent::CommandRejected { command, reason } => {
                self.commands_rejected += 1;
                self.log(LogLevel::Warning, format!("{} rejected: {}", command, reason));
            }
            ServiceEvent::AutoAdvanced { from, to } => {
                self.auto_advances += 1;
                let message = match to {
                    Some(next) => format!("Auto-advance: {} -> {}", from, next),
                    None => format!("Auto-advance: {} ended, playlist done", from),
                };
                self.log(LogLevel::Playback, message);
            }
            ServiceEvent::Kicked { session_id } => {
                self.kicks += 1;
                self.log(LogLevel::Warning, format!("Kicked: player #{}", session_id));
            }
        }
    }

    /// Currently declared connections
    pub fn active_connections(&self) -> usize {
        self.players + self.controllers
    }

    /// One-line summary of the playback state
    pub fn playback_summary(&self) -> String {
        let track = self.playback.track_id.as_deref().unwrap_or("-");
        match self.playback.mode {
            Mode::Idle => "Idle".to_string(),
            Mode::Scheduled => format!("Scheduled: {}", track),
            Mode::Playing => format!("Playing: {}", track),
            Mode::Paused => format!(
                "Paused: {} @ {}",
                track,
                format_offset(self.playback.paused_offset.unwrap_or(0))
            ),
        }
    }

    /// In-track position at reference time `now`, if a track is loaded
    pub fn position_ms(&self, now: i64) -> Option<i64> {
        match self.playback.mode {
            Mode::Idle => None,
            Mode::Paused => self.playback.paused_offset,
            Mode::Scheduled | Mode::Playing => self.playback.anchor_time.map(|a| now - a),
        }
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Format an in-track offset as m:ss
pub fn format_offset(offset_ms: i64) -> String {
    let secs = offset_ms.max(0) / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}
