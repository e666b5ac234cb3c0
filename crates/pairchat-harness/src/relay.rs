//! In-memory pairing relay
//!
//! Pairs participants first-come first-served. The participant whose `join`
//! completes a pair becomes the initiator, and the session id is the two
//! participant ids in sorted order joined by `-`. Offers, answers, candidates
//! and text are forwarded to the partner only. When a participant leaves,
//! re-joins, or drops its connection, its partner is told `partner_lost`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use pairchat_core::{
    InboundSignal, OutboundSignal, PairchatResult, ParticipantId, Role, SessionId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handle for one socket connected to the relay
pub type ConnectionId = u64;

/// Counters kept by the relay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub joins: u64,
    pub pairs_formed: u64,
    pub messages_routed: u64,
    /// Routed messages whose sender had no partner
    pub messages_dropped: u64,
    pub partner_losses: u64,
}

struct RelayConnection {
    participant: Option<ParticipantId>,
    inbox: mpsc::UnboundedSender<String>,
}

struct Pairing {
    partner: ParticipantId,
    session_id: SessionId,
}

#[derive(Default)]
struct RelayState {
    next_connection: ConnectionId,
    connections: HashMap<ConnectionId, RelayConnection>,
    /// Latest connection of each participant
    participants: HashMap<ParticipantId, ConnectionId>,
    waiting: VecDeque<ParticipantId>,
    pairs: HashMap<ParticipantId, Pairing>,
    duplicate_delivery: bool,
    stats: RelayStats,
}

// ----------------------------------------------------------------------------
// Pairing Relay
// ----------------------------------------------------------------------------

/// Shared pairing relay; clones refer to the same relay
#[derive(Clone, Default)]
pub struct PairingRelay {
    state: Arc<Mutex<RelayState>>,
}

impl PairingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every negotiation message twice
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.lock().duplicate_delivery = enabled;
    }

    /// Open a socket. Messages for it arrive as JSON on the returned receiver.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (inbox, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(
            id,
            RelayConnection {
                participant: None,
                inbox,
            },
        );
        debug!("Relay accepted connection {}", id);
        (id, receiver)
    }

    /// Handle one JSON message received on `connection`
    pub fn handle_message(&self, connection: ConnectionId, json: &str) -> PairchatResult<()> {
        let signal = OutboundSignal::from_json(json)?;
        let mut state = self.lock();
        if !state.connections.contains_key(&connection) {
            warn!("Relay dropping {} from closed connection {}", signal.name(), connection);
            return Ok(());
        }

        match signal {
            OutboundSignal::Join { participant_id } => {
                state.join(connection, participant_id);
            }
            OutboundSignal::Leave { participant_id } => {
                state.remove_from_queue(&participant_id);
                state.release_pair(&participant_id);
            }
            OutboundSignal::Offer {
                participant_id,
                description,
            } => state.route(&participant_id, InboundSignal::Offer { description }),
            OutboundSignal::Answer {
                participant_id,
                description,
            } => state.route(&participant_id, InboundSignal::Answer { description }),
            OutboundSignal::Candidate {
                participant_id,
                candidate,
            } => state.route(&participant_id, InboundSignal::Candidate { candidate }),
            OutboundSignal::TextMessage {
                participant_id,
                text,
            } => state.route(&participant_id, InboundSignal::TextMessage { text }),
        }
        Ok(())
    }

    /// Close a socket, releasing whoever was bound to it
    pub fn disconnect(&self, connection: ConnectionId) {
        let mut state = self.lock();
        let Some(closed) = state.connections.remove(&connection) else {
            return;
        };
        let Some(participant) = closed.participant else {
            return;
        };
        // A newer connection of the same participant keeps its place
        if state.participants.get(&participant) != Some(&connection) {
            return;
        }
        info!("Relay: {} disconnected", participant);
        state.participants.remove(&participant);
        state.remove_from_queue(&participant);
        state.release_pair(&participant);
    }

    pub fn waiting_participants(&self) -> Vec<ParticipantId> {
        self.lock().waiting.iter().cloned().collect()
    }

    pub fn partner_of(&self, participant: &ParticipantId) -> Option<ParticipantId> {
        self.lock()
            .pairs
            .get(participant)
            .map(|pairing| pairing.partner.clone())
    }

    pub fn session_of(&self, participant: &ParticipantId) -> Option<SessionId> {
        self.lock()
            .pairs
            .get(participant)
            .map(|pairing| pairing.session_id.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn stats(&self) -> RelayStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Relay State
// ----------------------------------------------------------------------------

impl RelayState {
    fn join(&mut self, connection: ConnectionId, participant: ParticipantId) {
        self.stats.joins += 1;
        if let Some(bound) = self.connections.get_mut(&connection) {
            bound.participant = Some(participant.clone());
        }
        self.participants.insert(participant.clone(), connection);

        // Re-joining abandons the current pairing
        self.release_pair(&participant);
        if self.waiting.contains(&participant) {
            debug!("Relay: {} is already waiting", participant);
            self.deliver(&participant, InboundSignal::Waiting);
            return;
        }

        match self.next_waiting(&participant) {
            Some(partner) => self.pair(participant, partner),
            None => {
                info!("Relay: {} is waiting for a partner", participant);
                self.waiting.push_back(participant.clone());
                self.deliver(&participant, InboundSignal::Waiting);
            }
        }
    }

    /// Oldest waiting participant that is still connected
    fn next_waiting(&mut self, joiner: &ParticipantId) -> Option<ParticipantId> {
        while let Some(candidate) = self.waiting.pop_front() {
            if &candidate != joiner && self.participants.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn pair(&mut self, initiator: ParticipantId, responder: ParticipantId) {
        let (low, high) = if initiator <= responder {
            (&initiator, &responder)
        } else {
            (&responder, &initiator)
        };
        let session_id = SessionId::new(format!("{}-{}", low, high));
        info!(
            "Relay paired {} (initiator) with {} in {}",
            initiator, responder, session_id
        );

        self.pairs.insert(
            initiator.clone(),
            Pairing {
                partner: responder.clone(),
                session_id: session_id.clone(),
            },
        );
        self.pairs.insert(
            responder.clone(),
            Pairing {
                partner: initiator.clone(),
                session_id: session_id.clone(),
            },
        );
        self.stats.pairs_formed += 1;

        self.deliver(
            &initiator,
            InboundSignal::Paired {
                session_id: session_id.clone(),
                role: Role::Initiator,
            },
        );
        self.deliver(
            &responder,
            InboundSignal::Paired {
                session_id,
                role: Role::Responder,
            },
        );
    }

    fn remove_from_queue(&mut self, participant: &ParticipantId) {
        self.waiting.retain(|queued| queued != participant);
    }

    /// Dissolve `participant`'s pairing and notify the partner
    fn release_pair(&mut self, participant: &ParticipantId) {
        let Some(pairing) = self.pairs.remove(participant) else {
            return;
        };
        self.pairs.remove(&pairing.partner);
        self.stats.partner_losses += 1;
        debug!(
            "Relay: {} left {}, notifying {}",
            participant, pairing.session_id, pairing.partner
        );
        self.deliver(&pairing.partner, InboundSignal::PartnerLost);
    }

    fn route(&mut self, sender: &ParticipantId, signal: InboundSignal) {
        let Some(partner) = self.pairs.get(sender).map(|p| p.partner.clone()) else {
            debug!("Relay dropping {} from unpaired {}", signal.name(), sender);
            self.stats.messages_dropped += 1;
            return;
        };
        self.stats.messages_routed += 1;
        self.deliver(&partner, signal);
    }

    fn deliver(&self, recipient: &ParticipantId, signal: InboundSignal) {
        let Some(connection) = self
            .participants
            .get(recipient)
            .and_then(|id| self.connections.get(id))
        else {
            debug!("Relay: {} is not connected, dropping {}", recipient, signal.name());
            return;
        };

        let json = match signal.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Relay could not encode {}: {}", signal.name(), e);
                return;
            }
        };

        let copies = if self.duplicate_delivery && is_negotiation(&signal) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            if connection.inbox.send(json.clone()).is_err() {
                debug!("Relay: inbox of {} is closed", recipient);
                return;
            }
        }
    }
}

fn is_negotiation(signal: &InboundSignal) -> bool {
    matches!(
        signal,
        InboundSignal::Paired { .. }
            | InboundSignal::Offer { .. }
            | InboundSignal::Answer { .. }
            | InboundSignal::Candidate { .. }
            | InboundSignal::PartnerLost
    )
}
