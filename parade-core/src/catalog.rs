//! Track catalog
//!
//! Read-only lookup of the tracks the coordinator may schedule. Every
//! device carries its own copy of each asset; the catalog only maps ids to
//! durations and asset references.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A track that can be scheduled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    /// Stable id used by the playlist and commands
    pub id: String,
    /// Display name
    pub name: String,
    /// Duration in milliseconds
    #[serde(rename = "duration")]
    pub duration_ms: i64,
    /// Reference to the local copy of the audio (file name, URL...)
    #[serde(default, alias = "file")]
    pub asset: String,
}

/// Errors when building a catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate track id: {0}")]
    DuplicateTrack(String),

    #[error("Track {0} has a non-positive duration")]
    InvalidDuration(String),
}

/// Lookup of tracks by id
pub trait TrackCatalog: Send + Sync {
    /// Look up a single track
    fn track(&self, id: &str) -> Option<TrackInfo>;

    /// All tracks in catalog order
    fn tracks(&self) -> Vec<TrackInfo>;

    fn contains(&self, id: &str) -> bool {
        self.track(id).is_some()
    }

    fn duration_ms(&self, id: &str) -> Option<i64> {
        self.track(id).map(|t| t.duration_ms)
    }
}

/// In-memory catalog, usually loaded from a JSON file at startup
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tracks: Vec<TrackInfo>,
    index: HashMap<String, usize>,
}

impl StaticCatalog {
    pub fn new(tracks: Vec<TrackInfo>) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(tracks.len());
        for (i, track) in tracks.iter().enumerate() {
            if track.duration_ms <= 0 {
                return Err(CatalogError::InvalidDuration(track.id.clone()));
            }
            if index.insert(track.id.clone(), i).is_some() {
                return Err(CatalogError::DuplicateTrack(track.id.clone()));
            }
        }
        Ok(Self { tracks, index })
    }

    /// Parse a JSON array of tracks
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let tracks: Vec<TrackInfo> = serde_json::from_str(json)?;
        Self::new(tracks)
    }

    /// Load a JSON catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Track ids in catalog order
    pub fn ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl TrackCatalog for StaticCatalog {
    fn track(&self, id: &str) -> Option<TrackInfo> {
        self.index.get(id).map(|&i| self.tracks[i].clone())
    }

    fn tracks(&self) -> Vec<TrackInfo> {
        self.tracks.clone()
    }
}
