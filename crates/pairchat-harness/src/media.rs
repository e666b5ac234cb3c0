//! Media source backed by a fixed track set

use pairchat_core::{
    CapabilityError, MediaSource, MediaTrack, PairchatResult, TrackKind, TrackSet,
};
use tokio::sync::watch;
use tracing::debug;

pub struct StaticMediaSource {
    tracks: watch::Sender<TrackSet>,
    unavailable: Option<String>,
}

impl StaticMediaSource {
    pub fn new(tracks: TrackSet) -> Self {
        let (sender, _) = watch::channel(tracks);
        Self {
            tracks: sender,
            unavailable: None,
        }
    }

    /// One audio and one video track
    pub fn camera_and_microphone() -> Self {
        Self::new(
            vec![
                MediaTrack::new("local-audio", TrackKind::Audio),
                MediaTrack::new("local-video", TrackKind::Video),
            ]
            .into_iter()
            .collect(),
        )
    }

    /// A source whose capture permission was refused
    pub fn unavailable<S: Into<String>>(reason: S) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::new(TrackSet::new())
        }
    }

    /// Publish a new track set to subscribers
    pub fn replace_tracks(&self, tracks: TrackSet) {
        self.tracks.send_replace(tracks);
    }
}

impl MediaSource for StaticMediaSource {
    fn tracks(&self) -> TrackSet {
        self.tracks.borrow().clone()
    }

    fn set_enabled(&self, enabled: bool) -> PairchatResult<()> {
        if let Some(reason) = &self.unavailable {
            return Err(CapabilityError::MediaUnavailable {
                reason: reason.clone(),
            }
            .into());
        }
        debug!("Local media {}", if enabled { "enabled" } else { "disabled" });
        let updated: TrackSet = self
            .tracks()
            .iter()
            .cloned()
            .map(|mut track| {
                track.enabled = enabled;
                track
            })
            .collect();
        self.tracks.send_replace(updated);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<TrackSet> {
        self.tracks.subscribe()
    }

    fn unavailable_reason(&self) -> Option<String> {
        self.unavailable.clone()
    }
}
