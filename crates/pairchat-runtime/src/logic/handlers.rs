//! Session Controller Handlers
//!
//! One handler per `EngineEvent`. Handlers mutate the `EngineContext` and
//! return the signals to send to the relay and the events to publish to the
//! UI; the task loop delivers both.

use pairchat_core::{
    AppEvent, ConnectionSignal, Disposition, EngineEvent, EngineStatus, Generation, IceCandidate,
    IgnoreReason, NegotiationEffect, NegotiationError, NegotiationEvent, NegotiationState,
    NegotiationTransition, OutboundSignal, PairchatResult, PairingAssignment, PeerConnectionState,
    Role, SdpType, SessionDescription, SessionEpoch, Timestamp, TrackId, TrackSet,
};
use tracing::{debug, error, info, warn};

use super::state::{ActiveSession, EngineContext, PairingPhase, TransportPhase};
use crate::managers::{CandidateDisposition, ConnectionResources};

// ----------------------------------------------------------------------------
// Handler Output
// ----------------------------------------------------------------------------

/// Signals for the relay and events for the UI produced by one handler
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandlerOutput {
    pub signals: Vec<OutboundSignal>,
    pub app_events: Vec<AppEvent>,
}

impl HandlerOutput {
    pub fn send(&mut self, signal: OutboundSignal) {
        self.signals.push(signal);
    }

    pub fn notify(&mut self, event: AppEvent) {
        self.app_events.push(event);
    }

    pub fn notify_opt(&mut self, event: Option<AppEvent>) {
        if let Some(event) = event {
            self.app_events.push(event);
        }
    }
}

// ----------------------------------------------------------------------------
// Session Handlers
// ----------------------------------------------------------------------------

/// Event handlers for the session controller
pub struct SessionHandlers;

impl SessionHandlers {
    // ------------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------------

    /// Abandon any current session and ask the relay for a new partner
    pub async fn request_new_session(ctx: &mut EngineContext) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        Self::request_pairing(ctx, &mut out).await;
        Ok(out)
    }

    /// User asked for a new chat. Clears the failure escalation.
    pub async fn handle_user_restart(ctx: &mut EngineContext) -> PairchatResult<HandlerOutput> {
        info!("User requested a new chat");
        ctx.consecutive_failures = 0;
        Self::request_new_session(ctx).await
    }

    pub async fn handle_user_leave(ctx: &mut EngineContext) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        ctx.rejoin_on_connect = false;
        if let Some(session) = ctx.session.take() {
            Self::teardown_session(ctx, session, "left by user", true, &mut out).await;
        } else if ctx.pairing != PairingPhase::Idle {
            if ctx.transport_connected() {
                out.send(OutboundSignal::Leave {
                    participant_id: ctx.participant_id.clone(),
                });
            }
            debug!("Withdrew pending pairing request");
        }
        ctx.pairing = PairingPhase::Idle;
        out.notify_opt(ctx.set_status(EngineStatus::Left));
        Ok(out)
    }

    pub async fn handle_pairing_waiting(ctx: &mut EngineContext) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        if ctx.pairing != PairingPhase::Requested {
            debug!("Ignoring waiting notice in pairing phase {:?}", ctx.pairing);
            ctx.stats.ignored_messages += 1;
            return Ok(out);
        }
        ctx.pairing = PairingPhase::Waiting;
        out.notify_opt(ctx.set_status(EngineStatus::Waiting));
        Ok(out)
    }

    /// Start a session for a pairing assignment
    pub async fn handle_pairing_assigned(
        ctx: &mut EngineContext,
        assignment: PairingAssignment,
    ) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();

        if let Some(current) = &ctx.session {
            if current.id == assignment.session_id {
                debug!("Duplicate pairing assignment for session {}", assignment.session_id);
                ctx.stats.ignored_messages += 1;
                return Ok(out);
            }
        }
        if let Some(previous) = ctx.session.take() {
            warn!(
                "Pairing assignment {} supersedes session {}",
                assignment.session_id, previous.id
            );
            Self::teardown_session(ctx, previous, "superseded by a new pairing", false, &mut out)
                .await;
        } else if ctx.pairing == PairingPhase::Idle {
            debug!(
                "Ignoring unsolicited pairing assignment {}",
                assignment.session_id
            );
            ctx.stats.ignored_messages += 1;
            return Ok(out);
        }
        ctx.pairing = PairingPhase::Idle;

        let epoch = ctx.next_epoch();
        let resources = match ConnectionResources::open(
            assignment.session_id.clone(),
            epoch,
            ctx.connection_factory.as_ref(),
            &ctx.config,
            ctx.internal_events.clone(),
        ) {
            Ok(resources) => resources,
            Err(e) => {
                error!(
                    "Could not build connection for session {}: {}",
                    assignment.session_id, e
                );
                if ctx.transport_connected() {
                    out.send(OutboundSignal::Leave {
                        participant_id: ctx.participant_id.clone(),
                    });
                }
                Self::escalate_failure(ctx, e.to_string(), &mut out).await;
                return Ok(out);
            }
        };

        let role = assignment.role;
        let mut session = ActiveSession::new(assignment.session_id, role, epoch, resources);
        info!("Session {} started as {} ({})", session.id, role, epoch);
        ctx.stats.sessions_started += 1;
        out.notify(AppEvent::SessionStarted {
            session_id: session.id.clone(),
            role,
        });
        out.notify_opt(ctx.set_input_enabled(false));
        out.notify_opt(ctx.set_status(EngineStatus::Negotiating));

        // Tracks go in before any offer so the offer carries them
        session.resources.attach_tracks(&ctx.local_tracks);

        let failure = Self::feed(ctx, &mut session, NegotiationEvent::Paired { role }, &mut out);

        if role == Role::Responder && failure.is_none() {
            if let Some(delay) = ctx.config.negotiation.responder_offer_fallback() {
                let events = ctx.internal_events.clone();
                session.offer_wait = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(EngineEvent::OfferWaitElapsed { epoch });
                }));
            }
        }

        Self::settle(ctx, session, failure, &mut out).await;
        Ok(out)
    }

    /// The partner left or dropped. No automatic re-pairing.
    pub async fn handle_partner_lost(ctx: &mut EngineContext) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        match ctx.session.take() {
            Some(session) => {
                info!("Partner left session {}", session.id);
                Self::teardown_session(ctx, session, "partner disconnected", false, &mut out)
                    .await;
                out.notify_opt(ctx.set_status(EngineStatus::PartnerDisconnected));
            }
            None => {
                debug!("Partner loss without an active session");
                ctx.stats.ignored_messages += 1;
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Relay Link
    // ------------------------------------------------------------------------

    pub async fn handle_transport_connected(ctx: &mut EngineContext) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        info!("Relay link connected");
        ctx.transport = TransportPhase::Connected;

        let terminal = matches!(ctx.status, EngineStatus::NegotiationFailed { .. });
        if ctx.rejoin_on_connect || (ctx.auto_join && !terminal) {
            Self::request_pairing(ctx, &mut out).await;
        } else if matches!(ctx.status, EngineStatus::Connecting | EngineStatus::Reconnecting) {
            out.notify_opt(ctx.set_status(EngineStatus::Left));
        }
        Ok(out)
    }

    /// Tear down and wait for the link to come back
    pub async fn handle_transport_disconnected(
        ctx: &mut EngineContext,
        reason: String,
    ) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        warn!("Relay link disconnected: {}", reason);
        ctx.transport = TransportPhase::Reconnecting;

        if let Some(session) = ctx.session.take() {
            Self::teardown_session(ctx, session, "relay link lost", false, &mut out).await;
            ctx.rejoin_on_connect = true;
        }
        if ctx.pairing != PairingPhase::Idle {
            ctx.pairing = PairingPhase::Idle;
            ctx.rejoin_on_connect = true;
        }
        out.notify_opt(ctx.set_input_enabled(false));
        if !matches!(ctx.status, EngineStatus::NegotiationFailed { .. }) {
            out.notify_opt(ctx.set_status(EngineStatus::Reconnecting));
        }
        Ok(out)
    }

    /// The link gave up. Terminal until the process restarts.
    pub async fn handle_transport_retry_exhausted(
        ctx: &mut EngineContext,
        attempts: u32,
    ) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        error!("Relay link gave up after {} attempts", attempts);
        ctx.transport = TransportPhase::Failed;
        if let Some(session) = ctx.session.take() {
            Self::teardown_session(ctx, session, "relay link unavailable", false, &mut out).await;
        }
        ctx.pairing = PairingPhase::Idle;
        ctx.rejoin_on_connect = false;
        out.notify_opt(ctx.set_input_enabled(false));
        out.notify_opt(ctx.set_status(EngineStatus::ConnectionFailed));
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Remote Negotiation Messages
    // ------------------------------------------------------------------------

    pub async fn handle_remote_offer(
        ctx: &mut EngineContext,
        description: SessionDescription,
    ) -> PairchatResult<HandlerOutput> {
        Self::feed_session(ctx, NegotiationEvent::RemoteOffer { description }).await
    }

    pub async fn handle_remote_answer(
        ctx: &mut EngineContext,
        description: SessionDescription,
    ) -> PairchatResult<HandlerOutput> {
        Self::feed_session(ctx, NegotiationEvent::RemoteAnswer { description }).await
    }

    pub async fn handle_remote_candidate(
        ctx: &mut EngineContext,
        candidate: IceCandidate,
    ) -> PairchatResult<HandlerOutput> {
        let out = HandlerOutput::default();
        let Some(session) = ctx.session.as_mut() else {
            debug!("Dropping candidate received without a session");
            ctx.stats.ignored_messages += 1;
            return Ok(out);
        };
        match session.resources.buffer_or_apply_candidate(candidate) {
            CandidateDisposition::Buffered => {
                debug!(
                    "Buffered remote candidate ({} pending)",
                    session.resources.buffered_candidates()
                );
            }
            CandidateDisposition::Applied => debug!("Applying remote candidate"),
            CandidateDisposition::Duplicate | CandidateDisposition::Discarded => {
                ctx.stats.ignored_messages += 1;
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Worker Completions and Connection Signals
    // ------------------------------------------------------------------------

    pub async fn handle_local_description_ready(
        ctx: &mut EngineContext,
        epoch: SessionEpoch,
        generation: Generation,
        kind: SdpType,
        result: Result<SessionDescription, String>,
    ) -> PairchatResult<HandlerOutput> {
        if !Self::accept_epoch(ctx, epoch, "local description") {
            return Ok(HandlerOutput::default());
        }
        let event = match (kind, result) {
            (SdpType::Answer, Ok(description)) => NegotiationEvent::LocalAnswerReady {
                generation,
                description,
            },
            (_, Ok(description)) => NegotiationEvent::LocalOfferReady {
                generation,
                description,
            },
            (_, Err(reason)) => NegotiationEvent::LocalDescriptionFailed { generation, reason },
        };
        Self::feed_session(ctx, event).await
    }

    pub async fn handle_remote_description_settled(
        ctx: &mut EngineContext,
        epoch: SessionEpoch,
        generation: Generation,
        result: Result<(), String>,
    ) -> PairchatResult<HandlerOutput> {
        if !Self::accept_epoch(ctx, epoch, "remote description") {
            return Ok(HandlerOutput::default());
        }
        let event = match result {
            Ok(()) => NegotiationEvent::RemoteDescriptionApplied { generation },
            Err(reason) => NegotiationEvent::RemoteDescriptionFailed { generation, reason },
        };
        Self::feed_session(ctx, event).await
    }

    pub async fn handle_track_attach_failed(
        ctx: &mut EngineContext,
        epoch: SessionEpoch,
        track_id: TrackId,
        reason: String,
    ) -> PairchatResult<HandlerOutput> {
        if Self::accept_epoch(ctx, epoch, "track attach failure") {
            warn!("Track {} not attached: {}", track_id, reason);
            if let Some(session) = ctx.session.as_mut() {
                session.resources.forget_track(&track_id);
            }
        }
        Ok(HandlerOutput::default())
    }

    pub async fn handle_connection_signal(
        ctx: &mut EngineContext,
        epoch: SessionEpoch,
        signal: ConnectionSignal,
    ) -> PairchatResult<HandlerOutput> {
        if !Self::accept_epoch(ctx, epoch, "connection signal") {
            return Ok(HandlerOutput::default());
        }
        match signal {
            ConnectionSignal::LocalCandidate(candidate) => {
                let mut out = HandlerOutput::default();
                out.send(OutboundSignal::Candidate {
                    participant_id: ctx.participant_id.clone(),
                    candidate,
                });
                Ok(out)
            }
            ConnectionSignal::StateChanged(PeerConnectionState::Connected) => {
                Self::feed_session(ctx, NegotiationEvent::ConnectivityEstablished).await
            }
            ConnectionSignal::StateChanged(state) => {
                debug!("Connection state {:?}", state);
                Ok(HandlerOutput::default())
            }
            ConnectionSignal::RemoteTrack { track_id, kind } => {
                let mut out = HandlerOutput::default();
                info!("Remote {} track {} arrived", kind, track_id);
                out.notify(AppEvent::RemoteTrackAdded { track_id, kind });
                Ok(out)
            }
        }
    }

    /// Connection-level loss is a negotiation failure
    pub async fn handle_connectivity_lost(
        ctx: &mut EngineContext,
        epoch: SessionEpoch,
        state: PeerConnectionState,
    ) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        if !Self::accept_epoch(ctx, epoch, "connectivity loss") {
            return Ok(out);
        }
        if let Some(session) = ctx.session.take() {
            let reason = NegotiationError::ConnectivityLost {
                reason: format!("connection {:?}", state),
            }
            .to_string();
            warn!("Session {}: {}", session.id, reason);
            Self::fail_session(ctx, session, reason, &mut out).await;
        }
        Ok(out)
    }

    /// Responder fallback: no offer arrived in time, so offer ourselves
    pub async fn handle_offer_wait_elapsed(
        ctx: &mut EngineContext,
        epoch: SessionEpoch,
    ) -> PairchatResult<HandlerOutput> {
        if !Self::accept_epoch(ctx, epoch, "offer wait timer") {
            return Ok(HandlerOutput::default());
        }
        let waiting = ctx
            .session
            .as_ref()
            .is_some_and(|s| s.negotiator.state() == NegotiationState::Idle);
        if !waiting {
            return Ok(HandlerOutput::default());
        }
        info!("No offer received in time, responder initiating");
        Self::feed_session(ctx, NegotiationEvent::Initiate).await
    }

    // ------------------------------------------------------------------------
    // User Input and Media
    // ------------------------------------------------------------------------

    pub async fn handle_send_text(
        ctx: &mut EngineContext,
        text: String,
    ) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(out);
        }
        if !ctx.input_enabled || ctx.session.is_none() {
            debug!("Text input is disabled; message not sent");
            return Ok(out);
        }
        out.send(OutboundSignal::TextMessage {
            participant_id: ctx.participant_id.clone(),
            text: text.clone(),
        });
        out.notify(AppEvent::TextSent {
            text,
            timestamp: Timestamp::now().as_millis(),
        });
        Ok(out)
    }

    pub async fn handle_text_received(
        ctx: &mut EngineContext,
        text: String,
    ) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        if ctx.session.is_none() {
            debug!("Dropping text received without a session");
            ctx.stats.ignored_messages += 1;
            return Ok(out);
        }
        out.notify(AppEvent::TextReceived {
            text,
            timestamp: Timestamp::now().as_millis(),
        });
        Ok(out)
    }

    pub async fn handle_set_media_enabled(
        ctx: &mut EngineContext,
        enabled: bool,
    ) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        match ctx.media.as_ref() {
            Some(media) => {
                if let Err(e) = media.set_enabled(enabled) {
                    warn!("Media toggle failed: {}", e);
                    out.notify(AppEvent::MediaUnavailable {
                        reason: e.to_string(),
                    });
                }
            }
            None => out.notify(AppEvent::MediaUnavailable {
                reason: "no media source".to_string(),
            }),
        }
        Ok(out)
    }

    /// The media source published a new track set
    pub async fn handle_tracks_changed(
        ctx: &mut EngineContext,
        tracks: TrackSet,
    ) -> PairchatResult<HandlerOutput> {
        ctx.local_tracks = tracks;
        if let Some(session) = ctx.session.as_mut() {
            session.resources.attach_tracks(&ctx.local_tracks);
        }
        Ok(HandlerOutput::default())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Close the negotiation and release the session's resources
    pub async fn teardown_session(
        ctx: &mut EngineContext,
        mut session: ActiveSession,
        reason: &str,
        send_leave: bool,
        out: &mut HandlerOutput,
    ) {
        session.cancel_offer_wait();

        // Resources first: callbacks are detached before the buffer is cleared
        let report = session.resources.teardown().await;
        if !report.already_torn_down {
            info!(
                "Session {} released {} track(s), discarded {} buffered candidate(s)",
                session.id, report.tracks_released, report.candidates_discarded
            );
            ctx.stats.discarded_candidates += report.candidates_discarded as u64;
        }
        match session.negotiator.reset() {
            Ok(transition) => {
                Self::apply_transition(ctx, &mut session, transition, out);
            }
            Err(e) => warn!("Could not close negotiation for {}: {}", session.id, e),
        }
        ctx.stats.teardowns += 1;
        ctx.last_negotiation_state = Some(session.negotiator.state());

        if send_leave && ctx.transport_connected() {
            out.send(OutboundSignal::Leave {
                participant_id: ctx.participant_id.clone(),
            });
        }
        out.notify_opt(ctx.set_input_enabled(false));
        info!("Session {} ended: {}", session.id, reason);
        out.notify(AppEvent::SessionEnded {
            session_id: session.id,
            reason: reason.to_string(),
        });
    }

    // ------------------------------------------------------------------------
    // Internal Helpers
    // ------------------------------------------------------------------------

    async fn request_pairing(ctx: &mut EngineContext, out: &mut HandlerOutput) {
        if let Some(session) = ctx.session.take() {
            Self::teardown_session(ctx, session, "restarted", true, out).await;
        }
        if !ctx.transport_connected() {
            debug!("Relay link down; pairing request deferred until it reconnects");
            ctx.rejoin_on_connect = true;
            return;
        }
        if ctx.pairing != PairingPhase::Idle {
            debug!("Pairing request already in flight");
            return;
        }

        ctx.pairing = PairingPhase::Requested;
        ctx.rejoin_on_connect = false;
        out.send(OutboundSignal::Join {
            participant_id: ctx.participant_id.clone(),
        });
        out.notify_opt(ctx.set_input_enabled(false));
        out.notify_opt(ctx.set_status(EngineStatus::LookingForPartner));
        info!("Requested a partner for {}", ctx.participant_id);
    }

    /// Tear down after a genuine failure, then re-pair within the retry budget
    async fn fail_session(
        ctx: &mut EngineContext,
        session: ActiveSession,
        reason: String,
        out: &mut HandlerOutput,
    ) {
        Self::teardown_session(ctx, session, &reason, true, out).await;
        Self::escalate_failure(ctx, reason, out).await;
    }

    async fn escalate_failure(ctx: &mut EngineContext, reason: String, out: &mut HandlerOutput) {
        ctx.stats.negotiation_failures += 1;
        ctx.consecutive_failures += 1;
        out.notify_opt(ctx.set_status(EngineStatus::NegotiationFailed {
            reason: reason.clone(),
        }));

        if ctx.consecutive_failures <= ctx.config.negotiation.max_negotiation_retries {
            info!(
                "Negotiation failed ({}); requesting a new partner (attempt {})",
                reason, ctx.consecutive_failures
            );
            ctx.stats.automatic_repairs += 1;
            Self::request_pairing(ctx, out).await;
        } else {
            warn!(
                "Negotiation failed {} time(s) in a row; waiting for the user: {}",
                ctx.consecutive_failures, reason
            );
        }
    }

    /// Drop completions and signals from superseded sessions
    fn accept_epoch(ctx: &mut EngineContext, epoch: SessionEpoch, what: &str) -> bool {
        if ctx.is_current(epoch) {
            return true;
        }
        debug!("Discarding {} from superseded session {}", what, epoch);
        ctx.stats.stale_completions += 1;
        false
    }

    async fn feed_session(
        ctx: &mut EngineContext,
        event: NegotiationEvent,
    ) -> PairchatResult<HandlerOutput> {
        let mut out = HandlerOutput::default();
        let Some(mut session) = ctx.session.take() else {
            debug!("Dropping {} received without a session", event.name());
            ctx.stats.ignored_messages += 1;
            return Ok(out);
        };
        let failure = Self::feed(ctx, &mut session, event, &mut out);
        Self::settle(ctx, session, failure, &mut out).await;
        Ok(out)
    }

    /// Put the session back, or fail it
    async fn settle(
        ctx: &mut EngineContext,
        session: ActiveSession,
        failure: Option<String>,
        out: &mut HandlerOutput,
    ) {
        match failure {
            Some(reason) => {
                warn!("Negotiation for session {} failed: {}", session.id, reason);
                Self::fail_session(ctx, session, reason, out).await;
            }
            None => ctx.session = Some(session),
        }
    }

    /// Run one negotiation event. Returns a failure reason if the negotiation
    /// failed.
    fn feed(
        ctx: &mut EngineContext,
        session: &mut ActiveSession,
        event: NegotiationEvent,
        out: &mut HandlerOutput,
    ) -> Option<String> {
        match session.negotiator.transition(event) {
            Ok(transition) => Self::apply_transition(ctx, session, transition, out),
            Err(e) => {
                warn!("Rejected negotiation step for session {}: {}", session.id, e);
                None
            }
        }
    }

    /// Execute a transition's effects in order
    fn apply_transition(
        ctx: &mut EngineContext,
        session: &mut ActiveSession,
        transition: NegotiationTransition,
        out: &mut HandlerOutput,
    ) -> Option<String> {
        let NegotiationTransition {
            from,
            to,
            disposition,
            effects,
            audit_entry,
        } = transition;
        ctx.record_audit(audit_entry);

        match disposition {
            Disposition::Applied => {}
            Disposition::Ignored(IgnoreReason::StaleGeneration { .. }) => {
                ctx.stats.stale_completions += 1;
            }
            Disposition::Ignored(_) => ctx.stats.ignored_messages += 1,
        }
        if from != to {
            out.notify(AppEvent::NegotiationStateChanged {
                session_id: session.id.clone(),
                from,
                to,
            });
        }

        let mut failure = None;
        for effect in effects {
            match effect {
                NegotiationEffect::CreateOffer { generation } => {
                    session.resources.create_offer(generation)
                }
                NegotiationEffect::CreateAnswer { generation } => {
                    session.resources.create_answer(generation)
                }
                NegotiationEffect::RollbackLocalOffer { generation } => {
                    session.resources.rollback(generation)
                }
                NegotiationEffect::ApplyRemoteDescription {
                    generation,
                    description,
                } => session.resources.apply_remote(generation, description),
                NegotiationEffect::SendOffer { description } => {
                    out.send(OutboundSignal::Offer {
                        participant_id: ctx.participant_id.clone(),
                        description,
                    })
                }
                NegotiationEffect::SendAnswer { description } => {
                    out.send(OutboundSignal::Answer {
                        participant_id: ctx.participant_id.clone(),
                        description,
                    })
                }
                NegotiationEffect::ClearCandidates => session.resources.reset_candidates(),
                NegotiationEffect::DrainCandidates => {
                    let drained = session.resources.drain_buffer();
                    debug!("Applying {} buffered candidate(s)", drained);
                }
                NegotiationEffect::Established => {
                    info!("Session {} negotiation stable", session.id);
                    ctx.stats.negotiations_established += 1;
                    ctx.consecutive_failures = 0;
                    session.cancel_offer_wait();
                    out.notify_opt(ctx.set_status(EngineStatus::Connected));
                    out.notify_opt(ctx.set_input_enabled(true));
                }
                NegotiationEffect::Failed { reason } => failure = Some(reason),
            }
        }

        if failure.is_none() && from != to {
            let follow_up = match to {
                NegotiationState::AwaitingLocalOffer => Some(NegotiationEvent::ProduceLocalOffer),
                NegotiationState::OfferReceived => Some(NegotiationEvent::ProduceLocalAnswer),
                _ => None,
            };
            if let Some(event) = follow_up {
                failure = Self::feed(ctx, session, event, out);
            }
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pairchat_core::channel::{create_engine_event_channel, EngineEventReceiver};
    use pairchat_core::{EngineConfig, ParticipantId, SessionId};
    use pairchat_harness::{MockConnectionFactory, StaticMediaSource};

    fn context() -> (EngineContext, EngineEventReceiver, MockConnectionFactory) {
        let (sender, receiver) = create_engine_event_channel();
        let factory = MockConnectionFactory::new("alice");
        let mut ctx = EngineContext::new(
            ParticipantId::new("alice"),
            EngineConfig::testing(),
            Arc::new(factory.clone()),
            Some(Arc::new(StaticMediaSource::camera_and_microphone())),
            sender,
        );
        ctx.transport = TransportPhase::Connected;
        (ctx, receiver, factory)
    }

    fn assignment(role: Role) -> PairingAssignment {
        PairingAssignment {
            session_id: SessionId::new("alice-bob"),
            role,
        }
    }

    #[tokio::test]
    async fn test_request_sends_join_once() {
        let (mut ctx, _events, _factory) = context();

        let out = SessionHandlers::request_new_session(&mut ctx).await.unwrap();
        assert_eq!(
            out.signals,
            vec![OutboundSignal::Join {
                participant_id: ParticipantId::new("alice")
            }]
        );
        assert_eq!(ctx.status, EngineStatus::LookingForPartner);

        let again = SessionHandlers::request_new_session(&mut ctx).await.unwrap();
        assert!(again.signals.is_empty());
    }

    #[tokio::test]
    async fn test_request_deferred_while_link_down() {
        let (mut ctx, _events, _factory) = context();
        ctx.transport = TransportPhase::Reconnecting;

        let out = SessionHandlers::request_new_session(&mut ctx).await.unwrap();
        assert!(out.signals.is_empty());
        assert!(ctx.rejoin_on_connect);
    }

    #[tokio::test]
    async fn test_initiator_assignment_starts_offer() {
        let (mut ctx, _events, _factory) = context();
        SessionHandlers::request_new_session(&mut ctx).await.unwrap();

        let out = SessionHandlers::handle_pairing_assigned(&mut ctx, assignment(Role::Initiator))
            .await
            .unwrap();

        assert!(ctx.snapshot().session_age_ms.is_some());
        let session = ctx.session.as_ref().expect("session started");
        assert_eq!(session.negotiator.state(), NegotiationState::AwaitingLocalOffer);
        assert!(session.negotiator.local_request_pending());
        assert_eq!(session.resources.tracks().len(), 2);
        assert_eq!(ctx.status, EngineStatus::Negotiating);
        assert!(out
            .app_events
            .iter()
            .any(|e| matches!(e, AppEvent::SessionStarted { role: Role::Initiator, .. })));
    }

    #[tokio::test]
    async fn test_duplicate_assignment_ignored() {
        let (mut ctx, _events, factory) = context();
        SessionHandlers::request_new_session(&mut ctx).await.unwrap();
        SessionHandlers::handle_pairing_assigned(&mut ctx, assignment(Role::Responder))
            .await
            .unwrap();

        let out = SessionHandlers::handle_pairing_assigned(&mut ctx, assignment(Role::Responder))
            .await
            .unwrap();
        assert!(out.signals.is_empty());
        assert!(out.app_events.is_empty());
        assert_eq!(ctx.stats.sessions_started, 1);
        assert_eq!(factory.connections_created(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_assignment_ignored() {
        let (mut ctx, _events, factory) = context();
        let out = SessionHandlers::handle_pairing_assigned(&mut ctx, assignment(Role::Initiator))
            .await
            .unwrap();
        assert!(out.app_events.is_empty());
        assert!(ctx.session.is_none());
        assert_eq!(factory.connections_created(), 0);
    }

    #[tokio::test]
    async fn test_partner_lost_tears_down_without_repair() {
        let (mut ctx, _events, factory) = context();
        SessionHandlers::request_new_session(&mut ctx).await.unwrap();
        SessionHandlers::handle_pairing_assigned(&mut ctx, assignment(Role::Initiator))
            .await
            .unwrap();

        let out = SessionHandlers::handle_partner_lost(&mut ctx).await.unwrap();

        assert!(ctx.session.is_none());
        assert!(out.signals.is_empty());
        assert_eq!(ctx.status, EngineStatus::PartnerDisconnected);
        assert_eq!(ctx.last_negotiation_state, Some(NegotiationState::Closed));
        assert!(!ctx.input_enabled);
        assert!(factory.last_connection().expect("connection").is_closed());
    }

    #[tokio::test]
    async fn test_teardown_reports_buffered_candidates() {
        let (mut ctx, _events, factory) = context();
        SessionHandlers::request_new_session(&mut ctx).await.unwrap();
        SessionHandlers::handle_pairing_assigned(&mut ctx, assignment(Role::Responder))
            .await
            .unwrap();
        for n in 0..3 {
            SessionHandlers::handle_remote_candidate(
                &mut ctx,
                IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", n, n)),
            )
            .await
            .unwrap();
        }
        assert_eq!(ctx.snapshot().buffered_candidates, 3);

        SessionHandlers::handle_partner_lost(&mut ctx).await.unwrap();

        assert_eq!(ctx.stats.discarded_candidates, 3);
        assert_eq!(ctx.stats.teardowns, 1);
        assert_eq!(ctx.last_negotiation_state, Some(NegotiationState::Closed));
        let connection = factory.last_connection().expect("connection");
        assert!(connection.handlers_detached());
        assert!(connection.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_stale_epoch_completion_discarded() {
        let (mut ctx, _events, _factory) = context();
        SessionHandlers::request_new_session(&mut ctx).await.unwrap();
        SessionHandlers::handle_pairing_assigned(&mut ctx, assignment(Role::Initiator))
            .await
            .unwrap();

        let out = SessionHandlers::handle_local_description_ready(
            &mut ctx,
            SessionEpoch::new(99),
            Generation::new(1),
            SdpType::Offer,
            Ok(SessionDescription::offer("late")),
        )
        .await
        .unwrap();

        assert!(out.signals.is_empty());
        assert_eq!(ctx.stats.stale_completions, 1);
        let session = ctx.session.as_ref().expect("session kept");
        assert_eq!(session.negotiator.state(), NegotiationState::AwaitingLocalOffer);
    }

    #[tokio::test]
    async fn test_text_requires_enabled_input() {
        let (mut ctx, _events, _factory) = context();
        let out = SessionHandlers::handle_send_text(&mut ctx, "hello".into())
            .await
            .unwrap();
        assert!(out.signals.is_empty());
    }

    #[tokio::test]
    async fn test_failure_escalates_after_retry_budget() {
        let (mut ctx, _events, _factory) = context();
        SessionHandlers::request_new_session(&mut ctx).await.unwrap();
        SessionHandlers::handle_pairing_assigned(&mut ctx, assignment(Role::Responder))
            .await
            .unwrap();
        let epoch = ctx.session.as_ref().map(|s| s.epoch).expect("session");

        // First failure: torn down, leave sent, fresh join issued
        let out = SessionHandlers::handle_connectivity_lost(
            &mut ctx,
            epoch,
            PeerConnectionState::Failed,
        )
        .await
        .unwrap();
        assert!(out
            .signals
            .iter()
            .any(|s| matches!(s, OutboundSignal::Leave { .. })));
        assert!(out
            .signals
            .iter()
            .any(|s| matches!(s, OutboundSignal::Join { .. })));
        assert_eq!(ctx.status, EngineStatus::LookingForPartner);

        // Second failure before Stable: terminal until the user restarts
        let second = PairingAssignment {
            session_id: SessionId::new("alice-carol"),
            role: Role::Responder,
        };
        SessionHandlers::handle_pairing_assigned(&mut ctx, second)
            .await
            .unwrap();
        let epoch = ctx.session.as_ref().map(|s| s.epoch).expect("session");
        let out = SessionHandlers::handle_connectivity_lost(
            &mut ctx,
            epoch,
            PeerConnectionState::Disconnected,
        )
        .await
        .unwrap();
        assert!(!out
            .signals
            .iter()
            .any(|s| matches!(s, OutboundSignal::Join { .. })));
        assert!(matches!(ctx.status, EngineStatus::NegotiationFailed { .. }));
        assert_eq!(ctx.stats.negotiation_failures, 2);
        assert_eq!(ctx.stats.automatic_repairs, 1);

        let restart = SessionHandlers::handle_user_restart(&mut ctx).await.unwrap();
        assert!(restart
            .signals
            .iter()
            .any(|s| matches!(s, OutboundSignal::Join { .. })));
        assert_eq!(ctx.consecutive_failures, 0);
    }
}
