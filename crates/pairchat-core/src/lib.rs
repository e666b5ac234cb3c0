//! Pairchat Core
//!
//! Foundational types for pairing two anonymous participants into a one-to-one
//! real-time session: identifiers, the relay wire schema, the offer/answer
//! negotiation state machine, candidate buffering, the local track set, and the
//! boundary traits through which the runtime talks to the relay link, the
//! negotiated connection object, and the local media capability.
//!
//! `pairchat-runtime` drives these types; this crate never spawns tasks.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod connection;
pub mod errors;
pub mod link;
pub mod media;
pub mod protocol;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{
    AppEvent, Command, EngineEvent, EngineSnapshot, EngineStats, EngineStatus, LinkEvent,
};
pub use config::{ChannelConfig, EngineConfig, IceConfig, NegotiationConfig, ReconnectPolicy};
pub use connection::{
    ConnectionSignal, ConnectionSignalReceiver, ConnectionSignalSender, PeerConnection,
    PeerConnectionFactory, PeerConnectionState,
};
pub use errors::{
    CapabilityError, NegotiationError, PairchatError, PairchatResult, ResourceError, Result,
    TransportError,
};
pub use link::SignalingLink;
pub use media::{MediaSource, MediaTrack, TrackId, TrackKind, TrackSet};
pub use protocol::{
    AuditEntry, CandidateBuffer, Disposition, IceCandidate, IgnoreReason, InboundSignal,
    NegotiationEffect, NegotiationEvent, NegotiationState, NegotiationTransition, Negotiator,
    OutboundSignal, PairingAssignment, SdpType, SessionDescription, StateTransitionError,
};
pub use types::{
    Generation, ParticipantId, Role, SessionEpoch, SessionId, Timestamp,
};
