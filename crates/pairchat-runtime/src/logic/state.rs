//! Session Controller State
//!
//! `EngineContext` is the single owned state of one engine instance: the
//! relay link phase, the pairing request, the active session with its
//! negotiator and connection resources, input availability, status,
//! statistics, and the negotiation audit trail.

use std::collections::VecDeque;
use std::sync::Arc;

use pairchat_core::{
    channel::EngineEventSender, AppEvent, AuditEntry, EngineConfig, EngineSnapshot, EngineStats,
    EngineStatus, MediaSource, NegotiationState, Negotiator, ParticipantId, PeerConnectionFactory,
    Role, SessionEpoch, SessionId, Timestamp, TrackSet,
};
use tokio::task::JoinHandle;

use crate::managers::ConnectionResources;

// ----------------------------------------------------------------------------
// Phases
// ----------------------------------------------------------------------------

/// Relay link phase as seen through its connect/disconnect edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPhase {
    Connecting,
    Connected,
    Reconnecting,
    /// The link exhausted its retry budget
    Failed,
}

/// Progress of a `join` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Idle,
    /// `join` sent, no answer yet
    Requested,
    /// Relay queued us
    Waiting,
}

// ----------------------------------------------------------------------------
// Active Session
// ----------------------------------------------------------------------------

/// One pairing and everything built for it
#[derive(Debug)]
pub struct ActiveSession {
    pub id: SessionId,
    pub role: Role,
    pub epoch: SessionEpoch,
    pub negotiator: Negotiator,
    pub resources: ConnectionResources,
    /// Responder fallback timer
    pub offer_wait: Option<JoinHandle<()>>,
    pub started_at: Timestamp,
}

impl ActiveSession {
    pub fn new(id: SessionId, role: Role, epoch: SessionEpoch, resources: ConnectionResources) -> Self {
        Self {
            negotiator: Negotiator::new(id.clone()),
            id,
            role,
            epoch,
            resources,
            offer_wait: None,
            started_at: Timestamp::now(),
        }
    }

    pub fn cancel_offer_wait(&mut self) {
        if let Some(timer) = self.offer_wait.take() {
            timer.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Engine Context
// ----------------------------------------------------------------------------

/// State owned by the session controller
pub struct EngineContext {
    pub participant_id: ParticipantId,
    pub config: EngineConfig,
    pub transport: TransportPhase,
    pub pairing: PairingPhase,
    pub session: Option<ActiveSession>,
    /// Epoch of the most recently opened session
    pub last_epoch: SessionEpoch,
    /// Final negotiation state of the last session torn down
    pub last_negotiation_state: Option<NegotiationState>,
    /// Failures since the last negotiation that reached Stable
    pub consecutive_failures: u32,
    /// Re-request pairing when the relay link comes back
    pub rejoin_on_connect: bool,
    /// Request pairing on every relay link connect
    pub auto_join: bool,
    pub input_enabled: bool,
    pub status: EngineStatus,
    /// Latest track set published by the media source
    pub local_tracks: TrackSet,
    pub audit_trail: VecDeque<AuditEntry>,
    pub start_time: Timestamp,
    pub stats: EngineStats,
    pub connection_factory: Arc<dyn PeerConnectionFactory>,
    pub media: Option<Arc<dyn MediaSource>>,
    /// Sender for results posted back by workers and timers
    pub internal_events: EngineEventSender,
}

impl EngineContext {
    pub fn new(
        participant_id: ParticipantId,
        config: EngineConfig,
        connection_factory: Arc<dyn PeerConnectionFactory>,
        media: Option<Arc<dyn MediaSource>>,
        internal_events: EngineEventSender,
    ) -> Self {
        let local_tracks = media
            .as_ref()
            .map(|source| source.tracks())
            .unwrap_or_default();
        let audit_capacity = config.audit_capacity;

        Self {
            participant_id,
            config,
            transport: TransportPhase::Connecting,
            pairing: PairingPhase::Idle,
            session: None,
            last_epoch: SessionEpoch::new(0),
            last_negotiation_state: None,
            consecutive_failures: 0,
            rejoin_on_connect: false,
            auto_join: true,
            input_enabled: false,
            status: EngineStatus::Connecting,
            local_tracks,
            audit_trail: VecDeque::with_capacity(audit_capacity.min(1024)),
            start_time: Timestamp::now(),
            stats: EngineStats::default(),
            connection_factory,
            media,
            internal_events,
        }
    }

    /// Allocate the epoch for a new session
    pub fn next_epoch(&mut self) -> SessionEpoch {
        self.last_epoch = self.last_epoch.next();
        self.last_epoch
    }

    /// Whether `epoch` belongs to the live session
    pub fn is_current(&self, epoch: SessionEpoch) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.epoch == epoch)
    }

    pub fn transport_connected(&self) -> bool {
        self.transport == TransportPhase::Connected
    }

    /// Update the status; yields an event only when it changed
    pub fn set_status(&mut self, status: EngineStatus) -> Option<AppEvent> {
        if self.status == status {
            return None;
        }
        self.status = status.clone();
        Some(AppEvent::StatusChanged { status })
    }

    pub fn set_input_enabled(&mut self, enabled: bool) -> Option<AppEvent> {
        if self.input_enabled == enabled {
            return None;
        }
        self.input_enabled = enabled;
        Some(AppEvent::InputAvailability { enabled })
    }

    /// Keep the last `audit_capacity` entries
    pub fn record_audit(&mut self, entry: AuditEntry) {
        if self.config.audit_capacity == 0 {
            return;
        }
        while self.audit_trail.len() >= self.config.audit_capacity {
            self.audit_trail.pop_front();
        }
        self.audit_trail.push_back(entry);
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let now = Timestamp::now();
        let session = self.session.as_ref();
        EngineSnapshot {
            participant_id: self.participant_id.clone(),
            status: self.status.clone(),
            transport_connected: self.transport_connected(),
            session_id: session.map(|s| s.id.clone()),
            role: session.map(|s| s.role),
            negotiation_state: session
                .map(|s| s.negotiator.state())
                .or(self.last_negotiation_state),
            attached_tracks: session.map(|s| s.resources.tracks().len()).unwrap_or(0),
            buffered_candidates: session
                .map(|s| s.resources.buffered_candidates())
                .unwrap_or(0),
            input_enabled: self.input_enabled,
            uptime_ms: now.duration_since(self.start_time).as_millis() as u64,
            session_age_ms: session.map(|s| now.duration_since(s.started_at).as_millis() as u64),
            stats: self.stats.clone(),
        }
    }
}
