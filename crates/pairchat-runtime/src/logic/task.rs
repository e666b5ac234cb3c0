//! Session Controller Task
//!
//! Contains the `SessionController` struct and its event loop.

use pairchat_core::{
    channel::{
        AppEventSender, ChannelError, CommandReceiver, EngineEventReceiver, LinkEventReceiver,
        OutboundSender,
    },
    AppEvent, Command, EngineEvent, EngineSnapshot, PairchatError, PairchatResult,
    TransportError,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handlers::{HandlerOutput, SessionHandlers};
use super::state::EngineContext;

// ----------------------------------------------------------------------------
// Session Controller
// ----------------------------------------------------------------------------

/// Processes every engine input one at a time
pub struct SessionController {
    /// Engine state
    context: EngineContext,
    /// Commands from the UI
    command_receiver: CommandReceiver,
    /// Edges and messages from the relay link
    link_event_receiver: LinkEventReceiver,
    /// Worker completions, connection signals, timers, media changes
    internal_receiver: EngineEventReceiver,
    /// Signals for the relay link
    outbound_sender: OutboundSender,
    /// Events for the UI
    app_event_sender: AppEventSender,
    track_watcher: Option<JoinHandle<()>>,
    link_open: bool,
    running: bool,
}

impl SessionController {
    pub fn new(
        context: EngineContext,
        command_receiver: CommandReceiver,
        link_event_receiver: LinkEventReceiver,
        internal_receiver: EngineEventReceiver,
        outbound_sender: OutboundSender,
        app_event_sender: AppEventSender,
    ) -> Self {
        Self {
            context,
            command_receiver,
            link_event_receiver,
            internal_receiver,
            outbound_sender,
            app_event_sender,
            track_watcher: None,
            link_open: true,
            running: true,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.context.snapshot()
    }

    /// Run the controller loop until shutdown
    pub async fn run(&mut self) -> PairchatResult<()> {
        info!("Session controller for {} starting", self.context.participant_id);
        self.start_track_watcher();
        self.announce_media();

        while self.running {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => {
                            if let Err(e) = self.process_command(command).await {
                                self.classify_error(e, "command");
                            }
                        }
                        None => {
                            info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }

                event = self.link_event_receiver.recv(), if self.link_open => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.handle_event(event.into()).await {
                                self.classify_error(e, "link event");
                            }
                        }
                        None => {
                            info!("Relay link channel closed");
                            self.link_open = false;
                        }
                    }
                }

                event = self.internal_receiver.recv() => {
                    if let Some(event) = event {
                        if let Err(e) = self.handle_event(event).await {
                            self.classify_error(e, "internal event");
                        }
                    }
                }
            }
        }

        self.stop_session().await;
        if let Some(watcher) = self.track_watcher.take() {
            watcher.abort();
        }
        info!("Session controller for {} stopped", self.context.participant_id);
        Ok(())
    }

    /// Stop the loop after the current event
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Channel and configuration errors stop the loop; the rest are logged
    fn classify_error(&mut self, error: PairchatError, origin: &str) {
        if error.is_unrecoverable() {
            error!(
                "Unrecoverable error processing {}, stopping session controller: {}",
                origin, error
            );
            self.running = false;
            return;
        }
        match &error {
            PairchatError::StateTransition(_) => {
                warn!("Rejected {} in current state: {}", origin, error)
            }
            PairchatError::Transport(_) => {
                warn!("Relay link problem while processing {}: {}", origin, error)
            }
            _ => error!("Error processing {}: {}", origin, error),
        }
    }

    async fn process_command(&mut self, command: Command) -> PairchatResult<()> {
        match command {
            Command::GetStatus => {
                let snapshot = self.context.snapshot();
                self.publish(AppEvent::StatusReport(snapshot));
                Ok(())
            }
            Command::Shutdown => {
                info!("Shutdown requested");
                self.running = false;
                Ok(())
            }
            other => match EngineEvent::from_command(other) {
                Some(event) => self.handle_event(event).await,
                None => Ok(()),
            },
        }
    }

    /// Dispatch one event to its handler and deliver the output
    pub async fn handle_event(&mut self, event: EngineEvent) -> PairchatResult<()> {
        debug!("Handling {}", event.name());
        let ctx = &mut self.context;

        let output = match event {
            EngineEvent::PairingAssigned(assignment) => {
                SessionHandlers::handle_pairing_assigned(ctx, assignment).await?
            }
            EngineEvent::PairingWaiting => SessionHandlers::handle_pairing_waiting(ctx).await?,
            EngineEvent::RemoteOffer(description) => {
                SessionHandlers::handle_remote_offer(ctx, description).await?
            }
            EngineEvent::RemoteAnswer(description) => {
                SessionHandlers::handle_remote_answer(ctx, description).await?
            }
            EngineEvent::RemoteCandidate(candidate) => {
                SessionHandlers::handle_remote_candidate(ctx, candidate).await?
            }
            EngineEvent::PartnerLost => SessionHandlers::handle_partner_lost(ctx).await?,
            EngineEvent::TextReceived(text) => {
                SessionHandlers::handle_text_received(ctx, text).await?
            }
            EngineEvent::TransportConnected => {
                SessionHandlers::handle_transport_connected(ctx).await?
            }
            EngineEvent::TransportDisconnected { reason } => {
                SessionHandlers::handle_transport_disconnected(ctx, reason).await?
            }
            EngineEvent::TransportRetryExhausted { attempts } => {
                SessionHandlers::handle_transport_retry_exhausted(ctx, attempts).await?
            }
            EngineEvent::UserRestart => SessionHandlers::handle_user_restart(ctx).await?,
            EngineEvent::UserLeave => SessionHandlers::handle_user_leave(ctx).await?,
            EngineEvent::SendText { text } => SessionHandlers::handle_send_text(ctx, text).await?,
            EngineEvent::SetMediaEnabled { enabled } => {
                SessionHandlers::handle_set_media_enabled(ctx, enabled).await?
            }
            EngineEvent::TracksChanged(tracks) => {
                SessionHandlers::handle_tracks_changed(ctx, tracks).await?
            }
            EngineEvent::LocalDescriptionReady {
                epoch,
                generation,
                kind,
                result,
            } => {
                SessionHandlers::handle_local_description_ready(ctx, epoch, generation, kind, result)
                    .await?
            }
            EngineEvent::RemoteDescriptionSettled {
                epoch,
                generation,
                result,
            } => {
                SessionHandlers::handle_remote_description_settled(ctx, epoch, generation, result)
                    .await?
            }
            EngineEvent::TrackAttachFailed {
                epoch,
                track_id,
                reason,
            } => SessionHandlers::handle_track_attach_failed(ctx, epoch, track_id, reason).await?,
            EngineEvent::Connection { epoch, signal } => {
                SessionHandlers::handle_connection_signal(ctx, epoch, signal).await?
            }
            EngineEvent::ConnectivityLost { epoch, state } => {
                SessionHandlers::handle_connectivity_lost(ctx, epoch, state).await?
            }
            EngineEvent::OfferWaitElapsed { epoch } => {
                SessionHandlers::handle_offer_wait_elapsed(ctx, epoch).await?
            }
        };

        self.deliver(output).await
    }

    /// Send signals to the relay link and publish app events without waiting
    async fn deliver(&mut self, output: HandlerOutput) -> PairchatResult<()> {
        for event in output.app_events {
            self.publish(event);
        }
        for signal in output.signals {
            let name = signal.name();
            if self.outbound_sender.send(signal).is_err() {
                return Err(TransportError::SendFailed {
                    message: name.to_string(),
                    reason: "relay link stopped".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Publish without blocking the loop on a slow UI
    fn publish(&self, event: AppEvent) {
        if let Err(e) = self.app_event_sender.try_send(event) {
            match ChannelError::from(e) {
                ChannelError::ChannelFull => warn!("App event channel full, dropping event"),
                ChannelError::ChannelClosed => debug!("No UI listening for app events"),
            }
        }
    }

    fn announce_media(&self) {
        let reason = match self.context.media.as_ref() {
            Some(media) => media.unavailable_reason(),
            None => Some("no media source configured".to_string()),
        };
        if let Some(reason) = reason {
            warn!("Continuing without local media: {}", reason);
            self.publish(AppEvent::MediaUnavailable { reason });
        }
    }

    /// Forward track set changes from the media source into the loop
    fn start_track_watcher(&mut self) {
        let Some(media) = self.context.media.as_ref() else {
            return;
        };
        let mut tracks = media.subscribe();
        let events = self.context.internal_events.clone();
        self.track_watcher = Some(tokio::spawn(async move {
            while tracks.changed().await.is_ok() {
                let current = tracks.borrow_and_update().clone();
                if events.send(EngineEvent::TracksChanged(current)).is_err() {
                    break;
                }
            }
        }));
    }

    /// Release the live session on the way out
    async fn stop_session(&mut self) {
        if let Some(session) = self.context.session.take() {
            let mut output = HandlerOutput::default();
            SessionHandlers::teardown_session(
                &mut self.context,
                session,
                "engine shutting down",
                true,
                &mut output,
            )
            .await;
            if let Err(e) = self.deliver(output).await {
                debug!("Could not deliver final signals: {}", e);
            }
        }
    }
}
