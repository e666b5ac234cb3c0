//! Negotiation protocol
//!
//! - `signal`: relay wire schema
//! - `negotiation`: offer/answer state machine
//! - `candidates`: remote candidate buffer

pub mod candidates;
pub mod negotiation;
pub mod signal;

pub use candidates::CandidateBuffer;
pub use negotiation::{
    AuditEntry, Disposition, IgnoreReason, NegotiationEffect, NegotiationEvent, NegotiationState,
    NegotiationTransition, Negotiator, StateTransitionError,
};
pub use signal::{
    IceCandidate, InboundSignal, OutboundSignal, PairingAssignment, SdpType, SessionDescription,
};
