//! Scriptable peer connection
//!
//! `MockPeerConnection` records every call, emits two local candidates after a
//! local description is set, and reports `Connecting` then `Connected` once
//! both descriptions are in place. Failures and delays are injected through
//! `MockBehavior`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pairchat_core::{
    ConnectionSignal, ConnectionSignalSender, IceCandidate, IceConfig, MediaTrack,
    PairchatError, PairchatResult, PeerConnection, PeerConnectionFactory, PeerConnectionState,
    ResourceError, SdpType, SessionDescription, TrackId, TrackKind,
};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded call on a mock connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Rollback,
    AddTrack(TrackId),
    RemoveTrack(TrackId),
    DetachHandlers,
    Close,
}

/// Injected behavior, fixed per connection at creation
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub fail_factory: bool,
    pub fail_create_offer: bool,
    pub fail_create_answer: bool,
    pub fail_set_remote: bool,
    pub fail_add_track: bool,
    /// Delay applied to create-offer and create-answer
    pub description_delay: Option<Duration>,
    /// Report connectivity once both descriptions are set
    pub auto_connect: bool,
    pub local_candidates: usize,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_factory: false,
            fail_create_offer: false,
            fail_create_answer: false,
            fail_set_remote: false,
            fail_add_track: false,
            description_delay: None,
            auto_connect: true,
            local_candidates: 2,
        }
    }
}

struct MockState {
    calls: Vec<MockCall>,
    signals: Option<ConnectionSignalSender>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    state: PeerConnectionState,
    tracks: Vec<TrackId>,
    candidates: Vec<IceCandidate>,
    descriptions_created: u32,
    connected_reported: bool,
}

impl MockState {
    fn emit(&self, signal: ConnectionSignal) {
        if let Some(signals) = &self.signals {
            let _ = signals.send(signal);
        }
    }
}

// ----------------------------------------------------------------------------
// Mock Peer Connection
// ----------------------------------------------------------------------------

pub struct MockPeerConnection {
    label: String,
    behavior: MockBehavior,
    state: Mutex<MockState>,
}

impl MockPeerConnection {
    pub fn new<S: Into<String>>(
        label: S,
        behavior: MockBehavior,
        signals: ConnectionSignalSender,
    ) -> Self {
        Self {
            label: label.into(),
            behavior,
            state: Mutex::new(MockState {
                calls: Vec::new(),
                signals: Some(signals),
                local: None,
                remote: None,
                state: PeerConnectionState::New,
                tracks: Vec::new(),
                candidates: Vec::new(),
                descriptions_created: 0,
                connected_reported: false,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).state == PeerConnectionState::Closed
    }

    pub fn handlers_detached(&self) -> bool {
        lock(&self.state).signals.is_none()
    }

    pub fn attached_tracks(&self) -> Vec<TrackId> {
        lock(&self.state).tracks.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    /// Force a connectivity state and report it if handlers are attached
    pub fn inject_state(&self, state: PeerConnectionState) {
        let mut guard = lock(&self.state);
        guard.state = state;
        guard.emit(ConnectionSignal::StateChanged(state));
    }

    fn record(&self, call: MockCall) -> MutexGuard<'_, MockState> {
        let mut guard = lock(&self.state);
        guard.calls.push(call);
        guard
    }

    async fn create_description(&self, kind: SdpType) -> PairchatResult<SessionDescription> {
        let call = match kind {
            SdpType::Offer => MockCall::CreateOffer,
            SdpType::Answer => MockCall::CreateAnswer,
        };
        let count = {
            let mut guard = self.record(call);
            guard.descriptions_created += 1;
            guard.descriptions_created
        };

        if let Some(delay) = self.behavior.description_delay {
            tokio::time::sleep(delay).await;
        }

        let fail = match kind {
            SdpType::Offer => self.behavior.fail_create_offer,
            SdpType::Answer => self.behavior.fail_create_answer,
        };
        if fail {
            return Err(PairchatError::description_creation_failed(
                kind.as_str(),
                "injected failure",
            ));
        }

        let sdp = format!("v=0 o={} {} {}", self.label, kind.as_str(), count);
        Ok(match kind {
            SdpType::Offer => SessionDescription::offer(sdp),
            SdpType::Answer => SessionDescription::answer(sdp),
        })
    }

    fn maybe_connect(&self, guard: &mut MockState) {
        if !self.behavior.auto_connect
            || guard.connected_reported
            || guard.local.is_none()
            || guard.remote.is_none()
        {
            return;
        }
        guard.connected_reported = true;
        guard.state = PeerConnectionState::Connected;
        guard.emit(ConnectionSignal::StateChanged(PeerConnectionState::Connecting));
        guard.emit(ConnectionSignal::StateChanged(PeerConnectionState::Connected));
        guard.emit(ConnectionSignal::RemoteTrack {
            track_id: TrackId::new(format!("{}-remote-audio", self.label)),
            kind: TrackKind::Audio,
        });
    }
}

#[async_trait::async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> PairchatResult<SessionDescription> {
        self.create_description(SdpType::Offer).await
    }

    async fn create_answer(&self) -> PairchatResult<SessionDescription> {
        self.create_description(SdpType::Answer).await
    }

    async fn set_local_description(&self, description: SessionDescription) -> PairchatResult<()> {
        let mut guard = self.record(MockCall::SetLocal(description.kind));
        guard.local = Some(description);
        if guard.state == PeerConnectionState::New {
            guard.state = PeerConnectionState::Connecting;
        }
        for n in 0..self.behavior.local_candidates {
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp {} 10.0.0.{} 5000{} typ host",
                self.label,
                2_130_706_431 - n,
                n + 1,
                n
            ))
            .with_mid("0", 0);
            guard.emit(ConnectionSignal::LocalCandidate(candidate));
        }
        self.maybe_connect(&mut guard);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> PairchatResult<()> {
        let mut guard = self.record(MockCall::SetRemote(description.kind));
        if self.behavior.fail_set_remote {
            return Err(PairchatError::description_application_failed(
                description.kind.as_str(),
                "injected failure",
            ));
        }
        guard.remote = Some(description);
        self.maybe_connect(&mut guard);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> PairchatResult<()> {
        let mut guard = self.record(MockCall::AddCandidate(candidate.candidate.clone()));
        if guard.remote.is_none() {
            return Err(PairchatError::candidate_rejected(
                "no remote description",
            ));
        }
        guard.candidates.push(candidate);
        Ok(())
    }

    async fn rollback(&self) -> PairchatResult<()> {
        let mut guard = self.record(MockCall::Rollback);
        guard.local = None;
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> PairchatResult<()> {
        let mut guard = self.record(MockCall::AddTrack(track.id.clone()));
        if self.behavior.fail_add_track {
            return Err(ResourceError::TrackAttachFailed {
                track_id: track.id.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        guard.tracks.push(track.id.clone());
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> PairchatResult<()> {
        let mut guard = self.record(MockCall::RemoveTrack(track_id.clone()));
        guard.tracks.retain(|id| id != track_id);
        Ok(())
    }

    fn detach_handlers(&self) {
        let mut guard = self.record(MockCall::DetachHandlers);
        guard.signals = None;
    }

    async fn close(&self) -> PairchatResult<()> {
        let mut guard = self.record(MockCall::Close);
        guard.state = PeerConnectionState::Closed;
        debug!("Mock connection {} closed", self.label);
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        lock(&self.state).state
    }
}

// ----------------------------------------------------------------------------
// Mock Connection Factory
// ----------------------------------------------------------------------------

/// Factory handing out `MockPeerConnection`s; clones share their state
#[derive(Clone)]
pub struct MockConnectionFactory {
    label: String,
    behavior: Arc<Mutex<MockBehavior>>,
    connections: Arc<Mutex<Vec<Arc<MockPeerConnection>>>>,
}

impl MockConnectionFactory {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
            behavior: Arc::new(Mutex::new(MockBehavior::default())),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    /// Behavior for connections created from now on
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.behavior) = behavior;
    }

    pub fn connections_created(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.connections).clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockPeerConnection>> {
        lock(&self.connections).last().cloned()
    }
}

impl PeerConnectionFactory for MockConnectionFactory {
    fn create(
        &self,
        _ice: &IceConfig,
        signals: ConnectionSignalSender,
    ) -> PairchatResult<Arc<dyn PeerConnection>> {
        let behavior = lock(&self.behavior).clone();
        if behavior.fail_factory {
            return Err(ResourceError::FactoryFailed {
                reason: "injected failure".to_string(),
            }
            .into());
        }

        let mut connections = lock(&self.connections);
        let label = format!("{}-{}", self.label, connections.len() + 1);
        let connection = Arc::new(MockPeerConnection::new(label, behavior, signals));
        connections.push(connection.clone());
        Ok(connection)
    }
}
