//! Offer/Answer Negotiation State Machine
//!
//! One `Negotiator` drives a single pairing from "just paired" to `Stable`.
//! Transitions are pure: every event returns the effects the caller must carry
//! out (create or apply descriptions, send messages, drain candidates) plus an
//! audit entry. Asynchronous work is tagged with the `Generation` current at
//! issue time; completions carrying an older tag are ignored.
//!
//! Remote messages never produce errors. A stale, duplicate, or out-of-state
//! remote message yields `Disposition::Ignored`. Only local operations invoked
//! in the wrong state return `StateTransitionError::InvalidTransition`.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::signal::SessionDescription;
use crate::types::{Generation, Role, SessionId, Timestamp};

// ----------------------------------------------------------------------------
// Negotiation State
// ----------------------------------------------------------------------------

/// Signaling phase of the current connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationState {
    Idle,
    AwaitingLocalOffer,
    OfferSent,
    OfferReceived,
    AwaitingLocalAnswer,
    AnswerSent,
    Stable,
    /// Terminal
    Closed,
}

impl NegotiationState {
    pub fn state_name(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "Idle",
            NegotiationState::AwaitingLocalOffer => "AwaitingLocalOffer",
            NegotiationState::OfferSent => "OfferSent",
            NegotiationState::OfferReceived => "OfferReceived",
            NegotiationState::AwaitingLocalAnswer => "AwaitingLocalAnswer",
            NegotiationState::AnswerSent => "AnswerSent",
            NegotiationState::Stable => "Stable",
            NegotiationState::Closed => "Closed",
        }
    }

    /// States in which a local offer may be outstanding
    fn holds_local_offer(&self) -> bool {
        matches!(
            self,
            NegotiationState::AwaitingLocalOffer | NegotiationState::OfferSent
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Inputs to the negotiation state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Pairing assignment received
    Paired { role: Role },
    /// Start offering without waiting for the remote side (responder fallback)
    Initiate,
    /// Request a local offer from the connection capability
    ProduceLocalOffer,
    LocalOfferReady {
        generation: Generation,
        description: SessionDescription,
    },
    /// Request a local answer from the connection capability
    ProduceLocalAnswer,
    LocalAnswerReady {
        generation: Generation,
        description: SessionDescription,
    },
    LocalDescriptionFailed {
        generation: Generation,
        reason: String,
    },
    RemoteOffer { description: SessionDescription },
    RemoteAnswer { description: SessionDescription },
    RemoteDescriptionApplied { generation: Generation },
    RemoteDescriptionFailed {
        generation: Generation,
        reason: String,
    },
    /// The underlying connection reported connectivity
    ConnectivityEstablished,
    /// Teardown
    Reset,
}

impl NegotiationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationEvent::Paired { .. } => "Paired",
            NegotiationEvent::Initiate => "Initiate",
            NegotiationEvent::ProduceLocalOffer => "ProduceLocalOffer",
            NegotiationEvent::LocalOfferReady { .. } => "LocalOfferReady",
            NegotiationEvent::ProduceLocalAnswer => "ProduceLocalAnswer",
            NegotiationEvent::LocalAnswerReady { .. } => "LocalAnswerReady",
            NegotiationEvent::LocalDescriptionFailed { .. } => "LocalDescriptionFailed",
            NegotiationEvent::RemoteOffer { .. } => "RemoteOffer",
            NegotiationEvent::RemoteAnswer { .. } => "RemoteAnswer",
            NegotiationEvent::RemoteDescriptionApplied { .. } => "RemoteDescriptionApplied",
            NegotiationEvent::RemoteDescriptionFailed { .. } => "RemoteDescriptionFailed",
            NegotiationEvent::ConnectivityEstablished => "ConnectivityEstablished",
            NegotiationEvent::Reset => "Reset",
        }
    }
}

// ----------------------------------------------------------------------------
// Effects and Results
// ----------------------------------------------------------------------------

/// Work the caller must carry out after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEffect {
    /// Create and set a local offer
    CreateOffer { generation: Generation },
    /// Create and set a local answer
    CreateAnswer { generation: Generation },
    /// Discard the local offer issued under `generation`
    RollbackLocalOffer { generation: Generation },
    ApplyRemoteDescription {
        generation: Generation,
        description: SessionDescription,
    },
    SendOffer { description: SessionDescription },
    SendAnswer { description: SessionDescription },
    /// Drop every buffered candidate; a new negotiation begins
    ClearCandidates,
    /// Apply buffered candidates; the remote description is now set
    DrainCandidates,
    /// Negotiation reached `Stable`
    Established,
    /// Genuine failure of the current attempt
    Failed { reason: String },
}

/// Why a message or completion was not applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    StaleGeneration {
        current: Generation,
        received: Generation,
    },
    Duplicate,
    /// Initiator keeps its own offer on collision
    GlareKeptLocalOffer,
    NotAcceptedInState(NegotiationState),
    Closed,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::StaleGeneration { current, received } => {
                write!(f, "stale generation {} (current {})", received, current)
            }
            IgnoreReason::Duplicate => write!(f, "duplicate"),
            IgnoreReason::GlareKeptLocalOffer => write!(f, "glare, kept local offer"),
            IgnoreReason::NotAcceptedInState(state) => write!(f, "not accepted in {}", state),
            IgnoreReason::Closed => write!(f, "negotiation closed"),
        }
    }
}

/// Outcome of feeding one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Ignored(IgnoreReason),
}

impl Disposition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Disposition::Applied)
    }
}

/// Result of a state transition
#[derive(Debug, Clone)]
pub struct NegotiationTransition {
    pub from: NegotiationState,
    pub to: NegotiationState,
    pub disposition: Disposition,
    /// Effects to execute in order
    pub effects: Vec<NegotiationEffect>,
    /// Audit trail entry
    pub audit_entry: AuditEntry,
}

impl NegotiationTransition {
    pub fn changed_state(&self) -> bool {
        self.from != self.to
    }

    pub fn reached_stable(&self) -> bool {
        self.effects
            .iter()
            .any(|effect| matches!(effect, NegotiationEffect::Established))
    }
}

/// Audit trail entry for negotiation transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub session_id: SessionId,
    pub generation: Generation,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub disposition: String,
    pub effects_count: usize,
}

/// Local operation invoked in a state that does not permit it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from_state} on event {event}: {reason}")]
    InvalidTransition {
        from_state: String,
        event: String,
        reason: String,
    },
}

// ----------------------------------------------------------------------------
// Negotiator
// ----------------------------------------------------------------------------

/// Negotiation state machine for one session
#[derive(Debug, Clone)]
pub struct Negotiator {
    session_id: SessionId,
    state: NegotiationState,
    role: Option<Role>,
    generation: Generation,
    /// A create-offer or create-answer call is outstanding
    local_request_pending: bool,
    /// Remote description of the current generation has been applied
    remote_applied: bool,
    /// Connectivity was reported while our answer was still being produced
    connectivity_early: bool,
    last_remote_offer: Option<SessionDescription>,
    last_remote_answer: Option<SessionDescription>,
}

type Outcome = (NegotiationState, Disposition, Vec<NegotiationEffect>);

impl Negotiator {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: NegotiationState::Idle,
            role: None,
            generation: Generation::INITIAL,
            local_request_pending: false,
            remote_applied: false,
            connectivity_early: false,
            last_remote_offer: None,
            last_remote_answer: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_stable(&self) -> bool {
        self.state == NegotiationState::Stable
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn local_request_pending(&self) -> bool {
        self.local_request_pending
    }

    /// Process an event. Local operations in the wrong state are errors;
    /// remote input in the wrong state is ignored.
    pub fn transition(
        &mut self,
        event: NegotiationEvent,
    ) -> Result<NegotiationTransition, StateTransitionError> {
        let from = self.state;
        let event_name = event.name();

        let (to, disposition, effects) = match event {
            NegotiationEvent::Paired { role } => self.handle_paired(role)?,
            NegotiationEvent::Initiate => self.handle_initiate()?,
            NegotiationEvent::ProduceLocalOffer => self.handle_produce_offer()?,
            NegotiationEvent::LocalOfferReady {
                generation,
                description,
            } => self.handle_local_offer(generation, description),
            NegotiationEvent::ProduceLocalAnswer => self.handle_produce_answer()?,
            NegotiationEvent::LocalAnswerReady {
                generation,
                description,
            } => self.handle_local_answer(generation, description),
            NegotiationEvent::LocalDescriptionFailed { generation, reason } => {
                self.handle_local_failure(generation, reason)
            }
            NegotiationEvent::RemoteOffer { description } => self.handle_remote_offer(description),
            NegotiationEvent::RemoteAnswer { description } => {
                self.handle_remote_answer(description)
            }
            NegotiationEvent::RemoteDescriptionApplied { generation } => {
                self.handle_remote_applied(generation)
            }
            NegotiationEvent::RemoteDescriptionFailed { generation, reason } => {
                self.handle_remote_failure(generation, reason)
            }
            NegotiationEvent::ConnectivityEstablished => self.handle_connectivity(),
            NegotiationEvent::Reset => self.handle_reset(),
        };

        self.state = to;

        let disposition_text = match &disposition {
            Disposition::Applied => "applied".to_string(),
            Disposition::Ignored(reason) => format!("ignored: {}", reason),
        };
        match &disposition {
            Disposition::Applied => debug!(
                session = %self.session_id,
                generation = %self.generation,
                "Negotiation {} -> {} on {}",
                from,
                to,
                event_name
            ),
            Disposition::Ignored(reason) => debug!(
                session = %self.session_id,
                generation = %self.generation,
                "Negotiation ignored {} in {}: {}",
                event_name,
                from,
                reason
            ),
        }

        let audit_entry = AuditEntry {
            timestamp: Timestamp::now(),
            session_id: self.session_id.clone(),
            generation: self.generation,
            from_state: from.state_name().to_string(),
            to_state: to.state_name().to_string(),
            event: event_name.to_string(),
            disposition: disposition_text,
            effects_count: effects.len(),
        };

        Ok(NegotiationTransition {
            from,
            to,
            disposition,
            effects,
            audit_entry,
        })
    }

    // ------------------------------------------------------------------------
    // Convenience Operations
    // ------------------------------------------------------------------------

    pub fn on_paired(&mut self, role: Role) -> Result<NegotiationTransition, StateTransitionError> {
        self.transition(NegotiationEvent::Paired { role })
    }

    pub fn initiate(&mut self) -> Result<NegotiationTransition, StateTransitionError> {
        self.transition(NegotiationEvent::Initiate)
    }

    pub fn produce_local_offer(&mut self) -> Result<NegotiationTransition, StateTransitionError> {
        self.transition(NegotiationEvent::ProduceLocalOffer)
    }

    pub fn produce_local_answer(&mut self) -> Result<NegotiationTransition, StateTransitionError> {
        self.transition(NegotiationEvent::ProduceLocalAnswer)
    }

    pub fn on_remote_offer(
        &mut self,
        description: SessionDescription,
    ) -> Result<NegotiationTransition, StateTransitionError> {
        self.transition(NegotiationEvent::RemoteOffer { description })
    }

    pub fn on_remote_answer(
        &mut self,
        description: SessionDescription,
    ) -> Result<NegotiationTransition, StateTransitionError> {
        self.transition(NegotiationEvent::RemoteAnswer { description })
    }

    /// Force `Closed`. Idempotent.
    pub fn reset(&mut self) -> Result<NegotiationTransition, StateTransitionError> {
        self.transition(NegotiationEvent::Reset)
    }

    // ------------------------------------------------------------------------
    // Local Operations
    // ------------------------------------------------------------------------

    fn invalid(&self, event: &str, reason: impl Into<String>) -> StateTransitionError {
        StateTransitionError::InvalidTransition {
            from_state: self.state.state_name().to_string(),
            event: event.to_string(),
            reason: reason.into(),
        }
    }

    fn handle_paired(&mut self, role: Role) -> Result<Outcome, StateTransitionError> {
        if self.state == NegotiationState::Closed {
            return Ok(ignored(self.state, IgnoreReason::Closed));
        }
        match self.role {
            Some(current) if current == role => {
                return Ok(ignored(self.state, IgnoreReason::Duplicate));
            }
            Some(current) => {
                return Err(self.invalid(
                    "Paired",
                    format!("already paired as {}, cannot become {}", current, role),
                ));
            }
            None => {}
        }
        if self.state != NegotiationState::Idle {
            return Err(self.invalid("Paired", "negotiation already in progress"));
        }

        self.role = Some(role);
        self.begin_generation();
        let to = match role {
            Role::Initiator => NegotiationState::AwaitingLocalOffer,
            Role::Responder => NegotiationState::Idle,
        };
        Ok((to, Disposition::Applied, vec![NegotiationEffect::ClearCandidates]))
    }

    fn handle_initiate(&mut self) -> Result<Outcome, StateTransitionError> {
        if self.state != NegotiationState::Idle {
            return Err(self.invalid("Initiate", "only an idle negotiation can initiate"));
        }
        if self.role.is_none() {
            return Err(self.invalid("Initiate", "not paired"));
        }
        Ok((NegotiationState::AwaitingLocalOffer, Disposition::Applied, Vec::new()))
    }

    fn handle_produce_offer(&mut self) -> Result<Outcome, StateTransitionError> {
        if self.state != NegotiationState::AwaitingLocalOffer {
            return Err(self.invalid(
                "ProduceLocalOffer",
                "an offer can only be produced from AwaitingLocalOffer",
            ));
        }
        if self.local_request_pending {
            return Err(self.invalid("ProduceLocalOffer", "offer already requested"));
        }
        self.local_request_pending = true;
        Ok((
            self.state,
            Disposition::Applied,
            vec![NegotiationEffect::CreateOffer {
                generation: self.generation,
            }],
        ))
    }

    fn handle_produce_answer(&mut self) -> Result<Outcome, StateTransitionError> {
        if self.state != NegotiationState::OfferReceived {
            return Err(self.invalid(
                "ProduceLocalAnswer",
                "an answer can only be produced from OfferReceived",
            ));
        }
        self.local_request_pending = true;
        Ok((
            NegotiationState::AwaitingLocalAnswer,
            Disposition::Applied,
            vec![NegotiationEffect::CreateAnswer {
                generation: self.generation,
            }],
        ))
    }

    // ------------------------------------------------------------------------
    // Asynchronous Completions
    // ------------------------------------------------------------------------

    fn stale(&self, generation: Generation) -> Option<Outcome> {
        if self.state == NegotiationState::Closed {
            return Some(ignored(self.state, IgnoreReason::Closed));
        }
        if generation != self.generation {
            return Some(ignored(
                self.state,
                IgnoreReason::StaleGeneration {
                    current: self.generation,
                    received: generation,
                },
            ));
        }
        None
    }

    fn handle_local_offer(
        &mut self,
        generation: Generation,
        description: SessionDescription,
    ) -> Outcome {
        if let Some(outcome) = self.stale(generation) {
            return outcome;
        }
        if self.state != NegotiationState::AwaitingLocalOffer || !self.local_request_pending {
            return ignored(self.state, IgnoreReason::NotAcceptedInState(self.state));
        }
        self.local_request_pending = false;
        (
            NegotiationState::OfferSent,
            Disposition::Applied,
            vec![NegotiationEffect::SendOffer { description }],
        )
    }

    fn handle_local_answer(
        &mut self,
        generation: Generation,
        description: SessionDescription,
    ) -> Outcome {
        if let Some(outcome) = self.stale(generation) {
            return outcome;
        }
        if self.state != NegotiationState::AwaitingLocalAnswer || !self.local_request_pending {
            return ignored(self.state, IgnoreReason::NotAcceptedInState(self.state));
        }
        self.local_request_pending = false;
        if self.connectivity_early {
            return (
                NegotiationState::Stable,
                Disposition::Applied,
                vec![
                    NegotiationEffect::SendAnswer { description },
                    NegotiationEffect::Established,
                ],
            );
        }
        (
            NegotiationState::AnswerSent,
            Disposition::Applied,
            vec![NegotiationEffect::SendAnswer { description }],
        )
    }

    fn handle_local_failure(&mut self, generation: Generation, reason: String) -> Outcome {
        if let Some(outcome) = self.stale(generation) {
            return outcome;
        }
        if !self.local_request_pending {
            return ignored(self.state, IgnoreReason::NotAcceptedInState(self.state));
        }
        self.local_request_pending = false;
        (
            self.state,
            Disposition::Applied,
            vec![NegotiationEffect::Failed { reason }],
        )
    }

    fn handle_remote_applied(&mut self, generation: Generation) -> Outcome {
        if let Some(outcome) = self.stale(generation) {
            return outcome;
        }
        if self.remote_applied {
            return ignored(self.state, IgnoreReason::Duplicate);
        }
        self.remote_applied = true;
        (
            self.state,
            Disposition::Applied,
            vec![NegotiationEffect::DrainCandidates],
        )
    }

    fn handle_remote_failure(&mut self, generation: Generation, reason: String) -> Outcome {
        if let Some(outcome) = self.stale(generation) {
            return outcome;
        }
        (
            self.state,
            Disposition::Applied,
            vec![NegotiationEffect::Failed { reason }],
        )
    }

    // ------------------------------------------------------------------------
    // Remote Messages
    // ------------------------------------------------------------------------

    fn handle_remote_offer(&mut self, description: SessionDescription) -> Outcome {
        match self.state {
            NegotiationState::Closed => ignored(self.state, IgnoreReason::Closed),
            NegotiationState::Idle => self.accept_remote_offer(description, Vec::new()),
            state if state.holds_local_offer() => {
                if self.role == Some(Role::Initiator) {
                    return ignored(state, IgnoreReason::GlareKeptLocalOffer);
                }
                // Responder yields: supersede the local offer and accept theirs
                let mut effects = Vec::new();
                if state == NegotiationState::OfferSent || self.local_request_pending {
                    effects.push(NegotiationEffect::RollbackLocalOffer {
                        generation: self.generation,
                    });
                    self.begin_generation();
                }
                trace!(session = %self.session_id, "Glare resolved in favour of remote offer");
                self.accept_remote_offer(description, effects)
            }
            state => {
                if self.last_remote_offer.as_ref() == Some(&description) {
                    ignored(state, IgnoreReason::Duplicate)
                } else {
                    ignored(state, IgnoreReason::NotAcceptedInState(state))
                }
            }
        }
    }

    fn accept_remote_offer(
        &mut self,
        description: SessionDescription,
        mut effects: Vec<NegotiationEffect>,
    ) -> Outcome {
        self.local_request_pending = false;
        self.remote_applied = false;
        self.last_remote_offer = Some(description.clone());
        effects.push(NegotiationEffect::ApplyRemoteDescription {
            generation: self.generation,
            description,
        });
        (NegotiationState::OfferReceived, Disposition::Applied, effects)
    }

    fn handle_remote_answer(&mut self, description: SessionDescription) -> Outcome {
        match self.state {
            NegotiationState::OfferSent => {
                self.remote_applied = false;
                self.last_remote_answer = Some(description.clone());
                (
                    NegotiationState::Stable,
                    Disposition::Applied,
                    vec![
                        NegotiationEffect::ApplyRemoteDescription {
                            generation: self.generation,
                            description,
                        },
                        NegotiationEffect::Established,
                    ],
                )
            }
            NegotiationState::Closed => ignored(self.state, IgnoreReason::Closed),
            state if self.last_remote_answer.as_ref() == Some(&description) => {
                ignored(state, IgnoreReason::Duplicate)
            }
            state => ignored(state, IgnoreReason::NotAcceptedInState(state)),
        }
    }

    fn handle_connectivity(&mut self) -> Outcome {
        match self.state {
            NegotiationState::AnswerSent => (
                NegotiationState::Stable,
                Disposition::Applied,
                vec![NegotiationEffect::Established],
            ),
            // The answer is set locally before its completion reaches us
            NegotiationState::AwaitingLocalAnswer if !self.connectivity_early => {
                self.connectivity_early = true;
                (self.state, Disposition::Applied, Vec::new())
            }
            NegotiationState::Stable => ignored(self.state, IgnoreReason::Duplicate),
            NegotiationState::Closed => ignored(self.state, IgnoreReason::Closed),
            state => ignored(state, IgnoreReason::NotAcceptedInState(state)),
        }
    }

    fn handle_reset(&mut self) -> Outcome {
        if self.state == NegotiationState::Closed {
            return ignored(self.state, IgnoreReason::Closed);
        }
        self.begin_generation();
        (
            NegotiationState::Closed,
            Disposition::Applied,
            vec![NegotiationEffect::ClearCandidates],
        )
    }

    /// Supersede every outstanding asynchronous call
    fn begin_generation(&mut self) {
        self.generation = self.generation.next();
        self.local_request_pending = false;
        self.remote_applied = false;
        self.connectivity_early = false;
    }
}

fn ignored(state: NegotiationState, reason: IgnoreReason) -> Outcome {
    (state, Disposition::Ignored(reason), Vec::new())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
