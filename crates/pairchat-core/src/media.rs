//! Local media tracks
//!
//! `TrackSet` is the set of local tracks attached to the negotiated connection,
//! keyed by track identifier so attaching twice is a no-op. `MediaSource` is the
//! boundary to the long-lived local capture capability, shared across sessions.

use core::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::Result;

// ----------------------------------------------------------------------------
// Track Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Stable track identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub enabled: bool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: TrackId::new(id),
            kind,
            enabled: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Track Set
// ----------------------------------------------------------------------------

/// Tracks keyed by identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSet {
    tracks: HashMap<TrackId, MediaTrack>,
}

impl TrackSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a track. Returns `false` if one with the same id is present.
    pub fn attach(&mut self, track: MediaTrack) -> bool {
        if self.tracks.contains_key(&track.id) {
            return false;
        }
        self.tracks.insert(track.id.clone(), track);
        true
    }

    pub fn detach(&mut self, id: &TrackId) -> Option<MediaTrack> {
        self.tracks.remove(id)
    }

    pub fn contains(&self, id: &TrackId) -> bool {
        self.tracks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.values()
    }

    /// Tracks in `self` whose id is absent from `other`
    pub fn missing_from<'a>(&'a self, other: &'a TrackSet) -> impl Iterator<Item = &'a MediaTrack> {
        self.tracks
            .values()
            .filter(move |track| !other.contains(&track.id))
    }

    pub fn drain(&mut self) -> Vec<MediaTrack> {
        self.tracks.drain().map(|(_, track)| track).collect()
    }
}

impl FromIterator<MediaTrack> for TrackSet {
    fn from_iter<I: IntoIterator<Item = MediaTrack>>(iter: I) -> Self {
        let mut set = TrackSet::new();
        for track in iter {
            set.attach(track);
        }
        set
    }
}

// ----------------------------------------------------------------------------
// Media Source Boundary
// ----------------------------------------------------------------------------

/// Local capture capability. Owns track lifecycle; the engine only reads the
/// current set and forwards explicit user toggles.
pub trait MediaSource: Send + Sync {
    /// Currently available tracks; empty when no media is available
    fn tracks(&self) -> TrackSet;

    /// Enable or disable every local track
    fn set_enabled(&self, enabled: bool) -> Result<()>;

    /// Receive the track set whenever it changes
    fn subscribe(&self) -> watch::Receiver<TrackSet>;

    /// Reason media could not be acquired, if any
    fn unavailable_reason(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_is_idempotent() {
        let mut set = TrackSet::new();
        assert!(set.attach(MediaTrack::new("mic", TrackKind::Audio)));
        assert!(!set.attach(MediaTrack::new("mic", TrackKind::Audio)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_missing_from() {
        let desired: TrackSet = vec![
            MediaTrack::new("mic", TrackKind::Audio),
            MediaTrack::new("cam", TrackKind::Video),
        ]
        .into_iter()
        .collect();
        let mut attached = TrackSet::new();
        attached.attach(MediaTrack::new("mic", TrackKind::Audio));

        let missing: Vec<_> = desired.missing_from(&attached).map(|t| t.id.clone()).collect();
        assert_eq!(missing, vec![TrackId::new("cam")]);
    }

    #[test]
    fn test_drain_empties() {
        let mut set: TrackSet = vec![MediaTrack::new("cam", TrackKind::Video)]
            .into_iter()
            .collect();
        assert_eq!(set.drain().len(), 1);
        assert!(set.is_empty());
    }
}
