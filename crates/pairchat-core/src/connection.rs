//! Negotiated Connection Boundary
//!
//! The engine drives an external peer connection object (browser-style
//! offer/answer API with trickled candidates) through `PeerConnection`.
//! Implementations report asynchronous happenings (locally gathered candidates,
//! connectivity changes, remote tracks) as `ConnectionSignal`s on the sender
//! handed to the factory, until `detach_handlers` is called.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::IceConfig;
use crate::media::{MediaTrack, TrackId, TrackKind};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::Result;

// ----------------------------------------------------------------------------
// Connection State and Signals
// ----------------------------------------------------------------------------

/// Connectivity state reported by the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Whether this state means the direct path is gone
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected | PeerConnectionState::Failed
        )
    }
}

/// Asynchronous notifications from a connection object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// Candidate gathered locally, to be trickled to the partner
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack { track_id: TrackId, kind: TrackKind },
}

pub type ConnectionSignalSender = mpsc::UnboundedSender<ConnectionSignal>;
pub type ConnectionSignalReceiver = mpsc::UnboundedReceiver<ConnectionSignal>;

// ----------------------------------------------------------------------------
// Peer Connection Trait
// ----------------------------------------------------------------------------

/// Negotiated connection object for one session
///
/// Calls are issued sequentially by a single worker per session, so
/// implementations need not tolerate overlapping calls.
#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Discard a pending local offer
    async fn rollback(&self) -> Result<()>;

    async fn add_track(&self, track: &MediaTrack) -> Result<()>;

    async fn remove_track(&self, track_id: &TrackId) -> Result<()>;

    /// Stop emitting signals. Called before a deliberate close.
    fn detach_handlers(&self);

    async fn close(&self) -> Result<()>;

    fn connection_state(&self) -> PeerConnectionState;
}

/// Builds one connection object per session
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        ice: &IceConfig,
        signals: ConnectionSignalSender,
    ) -> Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_states() {
        assert!(PeerConnectionState::Disconnected.is_lost());
        assert!(PeerConnectionState::Failed.is_lost());
        assert!(!PeerConnectionState::Closed.is_lost());
        assert!(!PeerConnectionState::Connected.is_lost());
    }
}
