//! Channel Communication Protocol Types
//!
//! All inter-task traffic flows through these types:
//! - `Command`: UI → controller
//! - `LinkEvent`: relay link → controller
//! - `OutboundSignal`: controller → relay link
//! - `AppEvent`: controller → UI
//!
//! `EngineEvent` is the closed set of inputs the controller processes one at a
//! time. Link events and commands are converted into it, and the connection
//! worker, connection signals, and timers post straight into it.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionSignal, PeerConnectionState};
use crate::media::{TrackId, TrackKind, TrackSet};
use crate::protocol::{
    IceCandidate, InboundSignal, NegotiationState, PairingAssignment, SdpType, SessionDescription,
};
use crate::types::{Generation, ParticipantId, Role, SessionEpoch, SessionId};

// ----------------------------------------------------------------------------
// Command: UI → Controller
// ----------------------------------------------------------------------------

/// Commands sent from the UI to the session controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Start a new chat, abandoning the current one
    UserRestart,
    /// Leave the current chat without re-pairing
    Leave,
    /// Send a text message to the partner
    SendText { text: String },
    /// Enable or disable local media
    SetMediaEnabled { enabled: bool },
    /// Request a status snapshot
    GetStatus,
    /// Shutdown the engine
    Shutdown,
}

// ----------------------------------------------------------------------------
// LinkEvent: Relay Link → Controller
// ----------------------------------------------------------------------------

/// Events reported by a relay link implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    Connected,
    Disconnected { reason: String },
    /// The link gave up reconnecting
    RetryExhausted { attempts: u32 },
    Signal(InboundSignal),
}

// ----------------------------------------------------------------------------
// EngineEvent: Controller Input
// ----------------------------------------------------------------------------

/// Every input the session controller reacts to
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PairingAssigned(PairingAssignment),
    PairingWaiting,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    PartnerLost,
    TextReceived(String),
    TransportConnected,
    TransportDisconnected { reason: String },
    TransportRetryExhausted { attempts: u32 },
    UserRestart,
    UserLeave,
    SendText { text: String },
    SetMediaEnabled { enabled: bool },
    /// The local media source published a new track set
    TracksChanged(TrackSet),
    /// Completion of a create-offer or create-answer call
    LocalDescriptionReady {
        epoch: SessionEpoch,
        generation: Generation,
        kind: SdpType,
        result: Result<SessionDescription, String>,
    },
    /// Completion of a remote description application
    RemoteDescriptionSettled {
        epoch: SessionEpoch,
        generation: Generation,
        result: Result<(), String>,
    },
    TrackAttachFailed {
        epoch: SessionEpoch,
        track_id: TrackId,
        reason: String,
    },
    /// Signal from the connection object built under `epoch`
    Connection {
        epoch: SessionEpoch,
        signal: ConnectionSignal,
    },
    /// The connection built under `epoch` went `Disconnected` or `Failed`
    ConnectivityLost {
        epoch: SessionEpoch,
        state: PeerConnectionState,
    },
    /// The responder waited long enough for a remote offer
    OfferWaitElapsed { epoch: SessionEpoch },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::PairingAssigned(_) => "PairingAssigned",
            EngineEvent::PairingWaiting => "PairingWaiting",
            EngineEvent::RemoteOffer(_) => "RemoteOffer",
            EngineEvent::RemoteAnswer(_) => "RemoteAnswer",
            EngineEvent::RemoteCandidate(_) => "RemoteCandidate",
            EngineEvent::PartnerLost => "PartnerLost",
            EngineEvent::TextReceived(_) => "TextReceived",
            EngineEvent::TransportConnected => "TransportConnected",
            EngineEvent::TransportDisconnected { .. } => "TransportDisconnected",
            EngineEvent::TransportRetryExhausted { .. } => "TransportRetryExhausted",
            EngineEvent::UserRestart => "UserRestart",
            EngineEvent::UserLeave => "UserLeave",
            EngineEvent::SendText { .. } => "SendText",
            EngineEvent::SetMediaEnabled { .. } => "SetMediaEnabled",
            EngineEvent::TracksChanged(_) => "TracksChanged",
            EngineEvent::LocalDescriptionReady { .. } => "LocalDescriptionReady",
            EngineEvent::RemoteDescriptionSettled { .. } => "RemoteDescriptionSettled",
            EngineEvent::TrackAttachFailed { .. } => "TrackAttachFailed",
            EngineEvent::Connection { .. } => "Connection",
            EngineEvent::ConnectivityLost { .. } => "ConnectivityLost",
            EngineEvent::OfferWaitElapsed { .. } => "OfferWaitElapsed",
        }
    }

    /// Convert a command; `GetStatus` and `Shutdown` are handled by the loop
    pub fn from_command(command: Command) -> Option<Self> {
        match command {
            Command::UserRestart => Some(EngineEvent::UserRestart),
            Command::Leave => Some(EngineEvent::UserLeave),
            Command::SendText { text } => Some(EngineEvent::SendText { text }),
            Command::SetMediaEnabled { enabled } => Some(EngineEvent::SetMediaEnabled { enabled }),
            Command::GetStatus | Command::Shutdown => None,
        }
    }
}

impl From<InboundSignal> for EngineEvent {
    fn from(signal: InboundSignal) -> Self {
        match signal {
            InboundSignal::Waiting => EngineEvent::PairingWaiting,
            InboundSignal::Paired { session_id, role } => {
                EngineEvent::PairingAssigned(PairingAssignment { session_id, role })
            }
            InboundSignal::Offer { description } => EngineEvent::RemoteOffer(description),
            InboundSignal::Answer { description } => EngineEvent::RemoteAnswer(description),
            InboundSignal::Candidate { candidate } => EngineEvent::RemoteCandidate(candidate),
            InboundSignal::PartnerLost => EngineEvent::PartnerLost,
            InboundSignal::TextMessage { text } => EngineEvent::TextReceived(text),
        }
    }
}

impl From<LinkEvent> for EngineEvent {
    fn from(event: LinkEvent) -> Self {
        match event {
            LinkEvent::Connected => EngineEvent::TransportConnected,
            LinkEvent::Disconnected { reason } => EngineEvent::TransportDisconnected { reason },
            LinkEvent::RetryExhausted { attempts } => {
                EngineEvent::TransportRetryExhausted { attempts }
            }
            LinkEvent::Signal(signal) => signal.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// AppEvent: Controller → UI
// ----------------------------------------------------------------------------

/// State changes the UI needs to know about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppEvent {
    /// The single status indicator changed
    StatusChanged { status: EngineStatus },
    /// Text input and media toggles enabled or disabled
    InputAvailability { enabled: bool },
    SessionStarted { session_id: SessionId, role: Role },
    SessionEnded { session_id: SessionId, reason: String },
    NegotiationStateChanged {
        session_id: SessionId,
        from: NegotiationState,
        to: NegotiationState,
    },
    TextReceived { text: String, timestamp: u64 },
    TextSent { text: String, timestamp: u64 },
    RemoteTrackAdded { track_id: TrackId, kind: TrackKind },
    /// No local media; negotiation proceeds without tracks
    MediaUnavailable { reason: String },
    /// Response to `Command::GetStatus`
    StatusReport(EngineSnapshot),
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// User-visible engine status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Connecting,
    LookingForPartner,
    Waiting,
    Negotiating,
    Connected,
    PartnerDisconnected,
    Left,
    Reconnecting,
    ConnectionFailed,
    NegotiationFailed { reason: String },
}

impl EngineStatus {
    /// Whether this status ends a session from the user's point of view
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineStatus::ConnectionFailed | EngineStatus::NegotiationFailed { .. }
        )
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStatus::Connecting => write!(f, "Connecting to server..."),
            EngineStatus::LookingForPartner => write!(f, "Looking for a partner..."),
            EngineStatus::Waiting => write!(f, "Waiting for someone to join..."),
            EngineStatus::Negotiating => write!(f, "Connected! Starting video..."),
            EngineStatus::Connected => write!(f, "Connected! Say hello."),
            EngineStatus::PartnerDisconnected => {
                write!(f, "Partner disconnected. Start a new chat!")
            }
            EngineStatus::Left => write!(f, "Chat ended. Start a new chat!"),
            EngineStatus::Reconnecting => {
                write!(f, "Disconnected from server. Trying to reconnect...")
            }
            EngineStatus::ConnectionFailed => {
                write!(f, "Unable to reach the server. Please reload.")
            }
            EngineStatus::NegotiationFailed { reason } => {
                write!(f, "Could not connect to partner: {}", reason)
            }
        }
    }
}

/// Counters kept by the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub sessions_started: u64,
    pub negotiations_established: u64,
    pub ignored_messages: u64,
    pub stale_completions: u64,
    pub teardowns: u64,
    /// Remote candidates still buffered when their session was torn down
    pub discarded_candidates: u64,
    pub negotiation_failures: u64,
    pub automatic_repairs: u64,
}

/// Point-in-time view of the engine, returned for `Command::GetStatus`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub participant_id: ParticipantId,
    pub status: EngineStatus,
    pub transport_connected: bool,
    pub session_id: Option<SessionId>,
    pub role: Option<Role>,
    pub negotiation_state: Option<NegotiationState>,
    pub attached_tracks: usize,
    pub buffered_candidates: usize,
    pub input_enabled: bool,
    /// Milliseconds since the engine started
    pub uptime_ms: u64,
    /// Milliseconds since the current session was paired
    pub session_age_ms: Option<u64>,
    pub stats: EngineStats,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_matches_client_wording() {
        assert_eq!(EngineStatus::LookingForPartner.to_string(), "Looking for a partner...");
        assert_eq!(
            EngineStatus::Waiting.to_string(),
            "Waiting for someone to join..."
        );
        assert_eq!(
            EngineStatus::PartnerDisconnected.to_string(),
            "Partner disconnected. Start a new chat!"
        );
    }

    #[test]
    fn test_link_signal_conversion() {
        let event: EngineEvent = LinkEvent::Signal(InboundSignal::Paired {
            session_id: SessionId::new("a-b"),
            role: Role::Responder,
        })
        .into();
        match event {
            EngineEvent::PairingAssigned(assignment) => {
                assert_eq!(assignment.session_id, SessionId::new("a-b"));
                assert_eq!(assignment.role, Role::Responder);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_loop_commands_have_no_event() {
        assert!(EngineEvent::from_command(Command::GetStatus).is_none());
        assert!(EngineEvent::from_command(Command::Shutdown).is_none());
        assert!(matches!(
            EngineEvent::from_command(Command::Leave),
            Some(EngineEvent::UserLeave)
        ));
    }

    #[test]
    fn test_command_serialization() {
        let cmd = Command::SendText {
            text: "hello".to_string(),
        };
        let serialized = serde_json::to_string(&cmd).unwrap();
        let deserialized: Command = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, cmd);
    }
}
