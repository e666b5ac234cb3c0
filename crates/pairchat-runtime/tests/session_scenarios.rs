//! End-to-end session scenarios
//!
//! Two engines talk through the in-memory pairing relay with mock peer
//! connections, exercising pairing, negotiation, teardown, relay link loss,
//! and failure recovery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pairchat_core::{
    channel::AppEventReceiver, AppEvent, ChannelConfig, Command, EngineConfig, EngineSnapshot, EngineStatus,
    NegotiationState, ParticipantId, PeerConnectionState, Role, SessionId, TrackId,
};
use pairchat_harness::{
    LinkController, MockBehavior, MockCall, MockConnectionFactory, PairingRelay, RelayLink,
    StaticMediaSource,
};
use pairchat_runtime::{EngineBuilder, EngineHandle};
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Peer {
    engine: EngineHandle,
    events: AppEventReceiver,
    factory: MockConnectionFactory,
    link: LinkController,
}

impl Peer {
    async fn start(
        relay: &PairingRelay,
        name: &str,
        config: EngineConfig,
        behavior: MockBehavior,
    ) -> Self {
        init_tracing();
        let factory = MockConnectionFactory::new(name).with_behavior(behavior);
        let link = RelayLink::new(relay.clone(), config.reconnect.clone());
        let controller = link.controller();

        let mut engine = EngineBuilder::new(ParticipantId::new(name))
            .with_config(config)
            .with_link(Box::new(link))
            .with_connection_factory(Arc::new(factory.clone()))
            .with_media(Arc::new(StaticMediaSource::camera_and_microphone()))
            .build_and_start()
            .await
            .expect("Failed to start engine");
        let events = engine
            .take_app_event_receiver()
            .expect("Failed to get app event receiver");

        Self {
            engine,
            events,
            factory,
            link: controller,
        }
    }

    /// Wait for the first event matching `predicate`, skipping the rest
    async fn wait_for<F>(&mut self, what: &str, mut predicate: F) -> AppEvent
    where
        F: FnMut(&AppEvent) -> bool,
    {
        let events = &mut self.events;
        timeout(EVENT_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Some(event) if predicate(&event) => break event,
                    Some(_) => continue,
                    None => panic!("app event channel closed while waiting for {}", what),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
    }

    async fn wait_for_status(&mut self, status: EngineStatus) {
        let label = format!("status {:?}", status);
        self.wait_for(&label, |event| {
            matches!(event, AppEvent::StatusChanged { status: s } if *s == status)
        })
        .await;
    }

    async fn snapshot(&mut self) -> EngineSnapshot {
        self.engine
            .send_command(Command::GetStatus)
            .await
            .expect("Failed to send command");
        match self
            .wait_for("status report", |e| matches!(e, AppEvent::StatusReport(_)))
            .await
        {
            AppEvent::StatusReport(snapshot) => snapshot,
            other => panic!("unexpected event {:?}", other),
        }
    }

    async fn command(&self, command: Command) {
        self.engine
            .send_command(command)
            .await
            .expect("Failed to send command");
    }
}

/// Start alice, let her queue, then start bob who completes the pair
async fn paired(
    relay: &PairingRelay,
    alice_behavior: MockBehavior,
    bob_behavior: MockBehavior,
    config: EngineConfig,
) -> (Peer, Peer) {
    let mut alice = Peer::start(relay, "alice", config.clone(), alice_behavior).await;
    alice.wait_for_status(EngineStatus::Waiting).await;
    let bob = Peer::start(relay, "bob", config, bob_behavior).await;
    (alice, bob)
}

async fn connected(relay: &PairingRelay) -> (Peer, Peer) {
    let (mut alice, mut bob) = paired(
        relay,
        MockBehavior::default(),
        MockBehavior::default(),
        EngineConfig::testing(),
    )
    .await;
    alice.wait_for_status(EngineStatus::Connected).await;
    bob.wait_for_status(EngineStatus::Connected).await;
    (alice, bob)
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_text_exchange() {
    let relay = PairingRelay::new();
    let (mut alice, mut bob) = paired(
        &relay,
        MockBehavior::default(),
        MockBehavior::default(),
        EngineConfig::testing(),
    )
    .await;

    let started = bob
        .wait_for("session start", |e| matches!(e, AppEvent::SessionStarted { .. }))
        .await;
    assert_eq!(
        started,
        AppEvent::SessionStarted {
            session_id: SessionId::new("alice-bob"),
            role: Role::Initiator,
        }
    );

    alice.wait_for_status(EngineStatus::Connected).await;
    bob.wait_for_status(EngineStatus::Connected).await;
    bob.wait_for("input enabled", |e| {
        matches!(e, AppEvent::InputAvailability { enabled: true })
    })
    .await;

    bob.command(Command::SendText {
        text: "  hello  ".to_string(),
    })
    .await;
    let received = alice
        .wait_for("text", |e| matches!(e, AppEvent::TextReceived { .. }))
        .await;
    assert!(matches!(received, AppEvent::TextReceived { text, .. } if text == "hello"));

    let snapshot = alice.snapshot().await;
    assert_eq!(snapshot.session_id, Some(SessionId::new("alice-bob")));
    assert_eq!(snapshot.role, Some(Role::Responder));
    assert_eq!(snapshot.negotiation_state, Some(NegotiationState::Stable));
    assert_eq!(snapshot.attached_tracks, 2);
    assert!(snapshot.input_enabled);
    assert_eq!(snapshot.stats.negotiations_established, 1);

    let bob_connection = bob.factory.last_connection().expect("bob connection");
    assert_eq!(bob_connection.attached_tracks().len(), 2);
    assert!(!bob_connection.applied_candidates().is_empty());
}

#[tokio::test]
async fn test_partner_leaves_mid_negotiation() {
    let relay = PairingRelay::new();
    let slow_offer = MockBehavior {
        description_delay: Some(Duration::from_millis(300)),
        ..MockBehavior::default()
    };
    let (mut alice, mut bob) = paired(
        &relay,
        MockBehavior::default(),
        slow_offer,
        EngineConfig::testing(),
    )
    .await;

    bob.wait_for("session start", |e| matches!(e, AppEvent::SessionStarted { .. }))
        .await;
    alice
        .wait_for("session start", |e| matches!(e, AppEvent::SessionStarted { .. }))
        .await;

    alice.command(Command::Leave).await;
    alice.wait_for_status(EngineStatus::Left).await;
    bob.wait_for_status(EngineStatus::PartnerDisconnected).await;

    // The slow offer resolves after teardown and must not resurrect anything
    tokio::time::sleep(Duration::from_millis(400)).await;
    let snapshot = bob.snapshot().await;
    assert!(snapshot.session_id.is_none());
    assert_eq!(snapshot.negotiation_state, Some(NegotiationState::Closed));
    assert!(!snapshot.input_enabled);
    assert!(relay.partner_of(&ParticipantId::new("bob")).is_none());

    let connection = bob.factory.last_connection().expect("bob connection");
    assert!(connection.is_closed());
    assert!(!connection
        .calls()
        .iter()
        .any(|call| matches!(call, MockCall::SetLocal(_))));
}

#[tokio::test]
async fn test_duplicate_delivery_is_tolerated() {
    let relay = PairingRelay::new();
    relay.set_duplicate_delivery(true);
    let (mut alice, mut bob) = connected(&relay).await;

    let alice_snapshot = alice.snapshot().await;
    let bob_snapshot = bob.snapshot().await;
    assert_eq!(alice_snapshot.stats.sessions_started, 1);
    assert_eq!(bob_snapshot.stats.sessions_started, 1);
    assert_eq!(alice.factory.connections_created(), 1);
    assert_eq!(bob.factory.connections_created(), 1);
    assert!(alice_snapshot.stats.ignored_messages + bob_snapshot.stats.ignored_messages > 0);
    assert_eq!(alice_snapshot.negotiation_state, Some(NegotiationState::Stable));
    assert_eq!(bob_snapshot.negotiation_state, Some(NegotiationState::Stable));

    // Each remote candidate applied once despite double delivery
    let applied = alice
        .factory
        .last_connection()
        .expect("alice connection")
        .applied_candidates();
    assert!(!applied.is_empty());
    let unique: HashSet<_> = applied.iter().collect();
    assert_eq!(applied.len(), unique.len());
}

#[tokio::test]
async fn test_restart_releases_every_resource() {
    let relay = PairingRelay::new();
    let (mut alice, mut bob) = connected(&relay).await;
    let old_connection = alice.factory.last_connection().expect("alice connection");

    alice.command(Command::UserRestart).await;
    alice
        .wait_for("session end", |e| matches!(e, AppEvent::SessionEnded { .. }))
        .await;
    bob.wait_for_status(EngineStatus::PartnerDisconnected).await;
    alice.wait_for_status(EngineStatus::Waiting).await;

    assert!(old_connection.is_closed());
    assert!(old_connection.handlers_detached());
    assert!(old_connection.attached_tracks().is_empty());

    let calls = old_connection.calls();
    let detach = calls
        .iter()
        .position(|c| *c == MockCall::DetachHandlers)
        .expect("handlers detached");
    let close = calls
        .iter()
        .position(|c| *c == MockCall::Close)
        .expect("connection closed");
    assert!(detach < close);
    for track in ["local-audio", "local-video"] {
        assert!(calls.contains(&MockCall::RemoveTrack(TrackId::new(track))));
    }

    // A late state change from the closed connection goes nowhere
    old_connection.inject_state(PeerConnectionState::Failed);
    let snapshot = alice.snapshot().await;
    assert_eq!(snapshot.status, EngineStatus::Waiting);
    assert_eq!(snapshot.stats.negotiation_failures, 0);
}

#[tokio::test]
async fn test_relay_link_drop_rejoins_after_reconnect() {
    let relay = PairingRelay::new();
    let (mut alice, mut bob) = connected(&relay).await;

    alice.link.fail_next_reconnects(1);
    alice.link.drop_connection("socket reset");

    alice.wait_for_status(EngineStatus::Reconnecting).await;
    bob.wait_for_status(EngineStatus::PartnerDisconnected).await;
    alice.wait_for_status(EngineStatus::Waiting).await;

    let snapshot = alice.snapshot().await;
    assert!(snapshot.transport_connected);
    assert!(snapshot.session_id.is_none());
    assert_eq!(relay.waiting_participants(), vec![ParticipantId::new("alice")]);
    assert!(alice
        .factory
        .last_connection()
        .expect("alice connection")
        .is_closed());
}

#[tokio::test]
async fn test_relay_link_exhaustion_is_terminal() {
    let relay = PairingRelay::new();
    let mut alice = Peer::start(
        &relay,
        "alice",
        EngineConfig::testing(),
        MockBehavior::default(),
    )
    .await;
    alice.wait_for_status(EngineStatus::Waiting).await;

    alice.link.refuse_reconnects();
    alice.link.drop_connection("server gone");

    alice.wait_for_status(EngineStatus::Reconnecting).await;
    alice.wait_for_status(EngineStatus::ConnectionFailed).await;

    alice.command(Command::UserRestart).await;
    let snapshot = alice.snapshot().await;
    assert_eq!(snapshot.status, EngineStatus::ConnectionFailed);
    assert!(!snapshot.transport_connected);
    assert!(relay.waiting_participants().is_empty());
}

#[tokio::test]
async fn test_negotiation_failure_repairs_automatically() {
    let relay = PairingRelay::new();
    let broken_offers = MockBehavior {
        fail_create_offer: true,
        ..MockBehavior::default()
    };
    let (mut alice, mut bob) = paired(
        &relay,
        MockBehavior::default(),
        broken_offers,
        EngineConfig::testing(),
    )
    .await;

    // Bob initiates, fails to produce an offer, and goes back to the queue
    bob.wait_for("negotiation failure", |e| {
        matches!(
            e,
            AppEvent::StatusChanged {
                status: EngineStatus::NegotiationFailed { .. }
            }
        )
    })
    .await;
    bob.wait_for_status(EngineStatus::Waiting).await;
    alice.wait_for_status(EngineStatus::PartnerDisconnected).await;
    assert!(bob
        .factory
        .last_connection()
        .expect("bob connection")
        .is_closed());

    // Alice re-joins and now initiates; bob only has to answer
    alice.command(Command::UserRestart).await;
    alice.wait_for_status(EngineStatus::Connected).await;
    bob.wait_for_status(EngineStatus::Connected).await;

    let snapshot = bob.snapshot().await;
    assert_eq!(snapshot.role, Some(Role::Responder));
    assert_eq!(snapshot.stats.negotiation_failures, 1);
    assert_eq!(snapshot.stats.automatic_repairs, 1);
    assert_eq!(bob.factory.connections_created(), 2);
}

#[tokio::test]
async fn test_responder_fallback_glare_resolves() {
    let relay = PairingRelay::new();
    let mut config = EngineConfig::testing();
    config.negotiation.responder_offer_fallback_ms = Some(10);
    let slow_initiator = MockBehavior {
        description_delay: Some(Duration::from_millis(150)),
        ..MockBehavior::default()
    };
    let (mut alice, mut bob) =
        paired(&relay, MockBehavior::default(), slow_initiator, config).await;

    alice.wait_for_status(EngineStatus::Connected).await;
    bob.wait_for_status(EngineStatus::Connected).await;

    // Alice offered first as responder, then yielded to bob's offer
    let alice_calls = alice
        .factory
        .last_connection()
        .expect("alice connection")
        .calls();
    assert!(alice_calls.contains(&MockCall::CreateOffer));
    assert!(alice_calls.contains(&MockCall::Rollback));
    assert!(alice_calls.contains(&MockCall::CreateAnswer));

    let bob_calls = bob
        .factory
        .last_connection()
        .expect("bob connection")
        .calls();
    assert!(!bob_calls.contains(&MockCall::CreateAnswer));

    let alice_snapshot = alice.snapshot().await;
    let bob_snapshot = bob.snapshot().await;
    assert_eq!(alice_snapshot.negotiation_state, Some(NegotiationState::Stable));
    assert_eq!(bob_snapshot.negotiation_state, Some(NegotiationState::Stable));
}

#[tokio::test]
async fn test_shutdown_sends_leave() {
    let relay = PairingRelay::new();
    let (mut alice, mut bob) = connected(&relay).await;

    bob.engine.shutdown().await.expect("Failed to shutdown");
    assert!(!bob.engine.is_running());
    alice.wait_for_status(EngineStatus::PartnerDisconnected).await;
    assert!(bob
        .factory
        .last_connection()
        .expect("bob connection")
        .is_closed());
}

#[tokio::test]
async fn test_candidate_flood_through_minimal_buffers() {
    let relay = PairingRelay::new();
    let mut config = EngineConfig::testing();
    config.channels = ChannelConfig {
        command_buffer_size: 1,
        link_event_buffer_size: 1,
        ..ChannelConfig::testing()
    };
    let chatty = MockBehavior {
        local_candidates: 100,
        ..MockBehavior::default()
    };
    let (mut alice, mut bob) = paired(&relay, chatty.clone(), chatty, config).await;

    alice.wait_for_status(EngineStatus::Connected).await;
    bob.wait_for_status(EngineStatus::Connected).await;

    for peer in [&alice, &bob] {
        let connection = peer.factory.last_connection().expect("connection");
        timeout(EVENT_TIMEOUT, async {
            while connection.applied_candidates().len() < 100 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("remote candidates never fully applied");
    }

    // Both controllers still answer once the flood is over
    let alice_snapshot = alice.snapshot().await;
    let bob_snapshot = bob.snapshot().await;
    assert_eq!(alice_snapshot.negotiation_state, Some(NegotiationState::Stable));
    assert_eq!(bob_snapshot.negotiation_state, Some(NegotiationState::Stable));

    bob.command(Command::SendText {
        text: "still here".to_string(),
    })
    .await;
    let received = alice
        .wait_for("text", |e| matches!(e, AppEvent::TextReceived { .. }))
        .await;
    assert!(matches!(received, AppEvent::TextReceived { text, .. } if text == "still here"));
}
