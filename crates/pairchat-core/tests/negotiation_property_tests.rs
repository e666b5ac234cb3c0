//! Property-based tests for the negotiation state machine
//!
//! Two negotiators are wired back to back through per-direction FIFO queues.
//! Each step picks one enabled action (deliver a message, complete an
//! asynchronous call, let the responder give up waiting and offer, report
//! connectivity) so every interleaving of delivery order gets explored.

use std::collections::VecDeque;

use pairchat_core::{
    CandidateBuffer, IceCandidate, NegotiationEffect, NegotiationEvent, NegotiationState,
    Negotiator, Role, SessionDescription, SessionId,
};
use proptest::prelude::*;

// ----------------------------------------------------------------------------
// Two-Peer Simulation
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Message {
    Paired(Role),
    Offer(SessionDescription),
    Answer(SessionDescription),
}

struct SimPeer {
    name: &'static str,
    negotiator: Negotiator,
    ops: VecDeque<NegotiationEffect>,
    inbox: VecDeque<Message>,
    offers_sent: usize,
    answers_sent: usize,
    answers_accepted: usize,
}

impl SimPeer {
    fn new(name: &'static str, role: Role) -> Self {
        let mut inbox = VecDeque::new();
        inbox.push_back(Message::Paired(role));
        Self {
            name,
            negotiator: Negotiator::new(SessionId::new("alice-bob")),
            ops: VecDeque::new(),
            inbox,
            offers_sent: 0,
            answers_sent: 0,
            answers_accepted: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Deliver(usize),
    RunOp(usize),
    Initiate(usize),
    Connectivity(usize),
}

/// Feed one event and carry out its effects the way the controller does
fn feed(peers: &mut [SimPeer; 2], idx: usize, event: NegotiationEvent) -> (bool, usize) {
    let transition = peers[idx]
        .negotiator
        .transition(event)
        .expect("simulation only issues valid local operations");

    let mut outgoing = Vec::new();
    for effect in transition.effects.iter().cloned() {
        match effect {
            NegotiationEffect::CreateOffer { .. }
            | NegotiationEffect::CreateAnswer { .. }
            | NegotiationEffect::ApplyRemoteDescription { .. }
            | NegotiationEffect::RollbackLocalOffer { .. } => peers[idx].ops.push_back(effect),
            NegotiationEffect::SendOffer { description } => {
                peers[idx].offers_sent += 1;
                outgoing.push(Message::Offer(description));
            }
            NegotiationEffect::SendAnswer { description } => {
                peers[idx].answers_sent += 1;
                outgoing.push(Message::Answer(description));
            }
            NegotiationEffect::ClearCandidates
            | NegotiationEffect::DrainCandidates
            | NegotiationEffect::Established => {}
            NegotiationEffect::Failed { reason } => {
                panic!("{} failed unexpectedly: {}", peers[idx].name, reason)
            }
        }
    }
    if transition.from == NegotiationState::OfferSent && transition.to == NegotiationState::Stable
    {
        peers[idx].answers_accepted += 1;
    }
    peers[1 - idx].inbox.extend(outgoing);

    if transition.changed_state() {
        match transition.to {
            NegotiationState::AwaitingLocalOffer => {
                feed(peers, idx, NegotiationEvent::ProduceLocalOffer);
            }
            NegotiationState::OfferReceived => {
                feed(peers, idx, NegotiationEvent::ProduceLocalAnswer);
            }
            _ => {}
        }
    }
    (transition.changed_state(), transition.effects.len())
}

fn enabled_actions(peers: &[SimPeer; 2], responder_fallback: bool) -> Vec<Action> {
    let mut actions = Vec::new();
    for idx in 0..2 {
        let peer = &peers[idx];
        if !peer.inbox.is_empty() {
            actions.push(Action::Deliver(idx));
        }
        if !peer.ops.is_empty() {
            actions.push(Action::RunOp(idx));
        }
        if responder_fallback
            && peer.negotiator.role() == Some(Role::Responder)
            && peer.negotiator.state() == NegotiationState::Idle
        {
            actions.push(Action::Initiate(idx));
        }
        if peer.negotiator.state() == NegotiationState::AnswerSent
            && peers[1 - idx].negotiator.is_stable()
            && peers[1 - idx].ops.is_empty()
        {
            actions.push(Action::Connectivity(idx));
        }
    }
    actions
}

fn perform(peers: &mut [SimPeer; 2], action: Action, redeliver: bool) {
    match action {
        Action::Deliver(idx) => {
            let message = match peers[idx].inbox.pop_front() {
                Some(message) => message,
                None => return,
            };
            let event = match &message {
                Message::Paired(role) => NegotiationEvent::Paired { role: *role },
                Message::Offer(description) => NegotiationEvent::RemoteOffer {
                    description: description.clone(),
                },
                Message::Answer(description) => NegotiationEvent::RemoteAnswer {
                    description: description.clone(),
                },
            };
            feed(peers, idx, event.clone());
            if redeliver {
                let (changed, effects) = feed(peers, idx, event);
                assert!(!changed, "redelivered {:?} changed state", message);
                assert_eq!(effects, 0, "redelivered {:?} produced effects", message);
            }
        }
        Action::RunOp(idx) => {
            let name = peers[idx].name;
            let event = match peers[idx].ops.pop_front() {
                Some(NegotiationEffect::CreateOffer { generation }) => {
                    NegotiationEvent::LocalOfferReady {
                        generation,
                        description: SessionDescription::offer(format!("{}-offer-{}", name, generation)),
                    }
                }
                Some(NegotiationEffect::CreateAnswer { generation }) => {
                    NegotiationEvent::LocalAnswerReady {
                        generation,
                        description: SessionDescription::answer(format!("{}-answer-{}", name, generation)),
                    }
                }
                Some(NegotiationEffect::ApplyRemoteDescription { generation, .. }) => {
                    NegotiationEvent::RemoteDescriptionApplied { generation }
                }
                _ => return,
            };
            feed(peers, idx, event);
        }
        Action::Initiate(idx) => {
            feed(peers, idx, NegotiationEvent::Initiate);
        }
        Action::Connectivity(idx) => {
            feed(peers, idx, NegotiationEvent::ConnectivityEstablished);
        }
    }
}

/// Run the schedule, then settle deterministically
fn simulate(schedule: &[u16], responder_fallback: bool) -> [SimPeer; 2] {
    let mut peers = [
        SimPeer::new("alice", Role::Initiator),
        SimPeer::new("bob", Role::Responder),
    ];
    for choice in schedule {
        let actions = enabled_actions(&peers, responder_fallback);
        if actions.is_empty() {
            break;
        }
        let action = actions[*choice as usize % actions.len()];
        perform(&mut peers, action, choice % 7 == 3);
    }
    for _ in 0..200 {
        let actions = enabled_actions(&peers, responder_fallback);
        match actions.first() {
            Some(action) => perform(&mut peers, *action, false),
            None => break,
        }
    }
    peers
}

// ----------------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------------

proptest! {
    /// Property: glare resolves by role and both sides reach Stable
    #[test]
    fn glare_converges_for_all_interleavings(
        schedule in prop::collection::vec(any::<u16>(), 0..64),
    ) {
        let peers = simulate(&schedule, true);
        prop_assert_eq!(peers[0].negotiator.state(), NegotiationState::Stable);
        prop_assert_eq!(peers[1].negotiator.state(), NegotiationState::Stable);
        // Initiator keeps its single offer and never answers
        prop_assert_eq!(peers[0].offers_sent, 1);
        prop_assert_eq!(peers[0].answers_sent, 0);
        prop_assert_eq!(peers[0].answers_accepted, 1);
        // Responder may have offered once before yielding
        prop_assert!(peers[1].offers_sent <= 1);
        prop_assert_eq!(peers[1].answers_sent, 1);
    }

    /// Property: without the fallback the responder never offers
    #[test]
    fn responder_never_offers_first(
        schedule in prop::collection::vec(any::<u16>(), 0..64),
    ) {
        let peers = simulate(&schedule, false);
        prop_assert_eq!(peers[1].offers_sent, 0);
        prop_assert_eq!(peers[0].offers_sent, 1);
        prop_assert!(peers[0].negotiator.is_stable());
        prop_assert!(peers[1].negotiator.is_stable());
    }

    /// Property: candidates are applied once each, in receipt order, however
    /// many arrive before the remote description is set
    #[test]
    fn candidates_apply_in_order_exactly_once(
        count in 0usize..40,
        split in 0usize..40,
    ) {
        let split = split.min(count);
        let candidates: Vec<IceCandidate> = (0..count)
            .map(|n| IceCandidate::new(format!("candidate:{}", n)))
            .collect();

        let mut buffer = CandidateBuffer::new();
        let mut applied = Vec::new();
        for candidate in &candidates[..split] {
            prop_assert!(buffer.push(candidate.clone()).is_none());
        }
        applied.extend(buffer.drain().unwrap_or_default());
        prop_assert!(buffer.drain().is_none());
        for candidate in &candidates[split..] {
            if let Some(direct) = buffer.push(candidate.clone()) {
                applied.push(direct);
            }
        }

        prop_assert_eq!(applied, candidates);
        prop_assert!(buffer.is_empty());
    }

    /// Property: after reset no completion of any earlier generation has effects
    #[test]
    fn reset_discards_all_inflight_completions(generations in prop::collection::vec(0u64..6, 1..10)) {
        let mut negotiator = Negotiator::new(SessionId::new("a-b"));
        negotiator.on_paired(Role::Initiator).unwrap();
        negotiator.produce_local_offer().unwrap();
        negotiator.reset().unwrap();

        for raw in generations {
            let generation = pairchat_core::Generation::new(raw);
            let events = vec![
                NegotiationEvent::LocalOfferReady {
                    generation,
                    description: SessionDescription::offer("late"),
                },
                NegotiationEvent::RemoteDescriptionApplied { generation },
                NegotiationEvent::LocalDescriptionFailed { generation, reason: "late".into() },
            ];
            for event in events {
                let transition = negotiator.transition(event).unwrap();
                prop_assert!(transition.effects.is_empty());
                prop_assert_eq!(transition.to, NegotiationState::Closed);
            }
        }
    }
}
