//! Pairchat application wiring
//!
//! `PairchatApp` owns the in-process pairing relay and starts engines against
//! it. Each started engine is a `Participant` holding its handle, its app
//! event stream, and the fault-injection handle of its relay link.

use std::sync::Arc;
use std::time::Duration;

use pairchat_core::{
    channel::AppEventReceiver, AppEvent, Command, EngineSnapshot, EngineStatus, MediaSource,
    ParticipantId,
};
use pairchat_harness::{
    LinkController, MockConnectionFactory, PairingRelay, RelayLink, StaticMediaSource,
};
use pairchat_runtime::{EngineBuilder, EngineHandle};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

pub struct PairchatApp {
    config: AppConfig,
    relay: PairingRelay,
}

impl PairchatApp {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            relay: PairingRelay::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn relay(&self) -> &PairingRelay {
        &self.relay
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.config.cli.event_timeout_secs)
    }

    /// Start an engine connected to the relay
    pub async fn start_participant(&self, participant_id: ParticipantId) -> Result<Participant> {
        let link = RelayLink::new(self.relay.clone(), self.config.engine.reconnect.clone());
        let link_controller = link.controller();

        let mut builder = EngineBuilder::new(participant_id.clone())
            .with_config(self.config.engine.clone())
            .with_link(Box::new(link))
            .with_connection_factory(Arc::new(MockConnectionFactory::new(
                participant_id.as_str(),
            )));
        if self.config.cli.with_media {
            let media: Arc<dyn MediaSource> = Arc::new(StaticMediaSource::camera_and_microphone());
            builder = builder.with_media(media);
        }

        let mut engine = builder.build_and_start().await?;
        let events = engine
            .take_app_event_receiver()
            .ok_or_else(|| CliError::Session("app event receiver already taken".to_string()))?;
        info!("Participant {} started", participant_id);

        Ok(Participant {
            id: participant_id,
            engine,
            events,
            link: link_controller,
            timeout: self.event_timeout(),
        })
    }
}

// ----------------------------------------------------------------------------
// Participant
// ----------------------------------------------------------------------------

pub struct Participant {
    pub id: ParticipantId,
    pub engine: EngineHandle,
    pub events: AppEventReceiver,
    pub link: LinkController,
    timeout: Duration,
}

impl Participant {
    pub async fn send(&self, command: Command) -> Result<()> {
        Ok(self.engine.send_command(command).await?)
    }

    /// Wait for an event matching `predicate`, printing every event seen
    pub async fn wait_for<F>(&mut self, what: &str, mut predicate: F) -> Result<AppEvent>
    where
        F: FnMut(&AppEvent) -> bool,
    {
        let id = self.id.clone();
        let events = &mut self.events;
        let found = tokio::time::timeout(self.timeout, async {
            while let Some(event) = events.recv().await {
                if let Some(line) = describe_event(&event) {
                    println!("[{}] {}", id, line);
                }
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .map_err(|_| CliError::Timeout(format!("{} at {}", what, self.id)))?;

        found.ok_or_else(|| CliError::Session(format!("engine {} stopped", self.id)))
    }

    pub async fn wait_for_status(&mut self, status: EngineStatus) -> Result<()> {
        let what = format!("status \"{}\"", status);
        self.wait_for(&what, |event| {
            matches!(event, AppEvent::StatusChanged { status: s } if *s == status)
        })
        .await?;
        Ok(())
    }

    /// Wait until the relay has answered our join
    pub async fn wait_until_queued_or_paired(&mut self) -> Result<()> {
        self.wait_for("pairing response", |event| {
            matches!(
                event,
                AppEvent::StatusChanged {
                    status: EngineStatus::Waiting | EngineStatus::Negotiating
                }
            )
        })
        .await?;
        Ok(())
    }

    pub async fn snapshot(&mut self) -> Result<EngineSnapshot> {
        self.send(Command::GetStatus).await?;
        match self
            .wait_for("status report", |e| matches!(e, AppEvent::StatusReport(_)))
            .await?
        {
            AppEvent::StatusReport(snapshot) => Ok(snapshot),
            other => Err(CliError::Session(format!("unexpected event {:?}", other))),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        debug!("Stopping participant {}", self.id);
        Ok(self.engine.shutdown().await?)
    }
}

/// One-line rendering of an app event, `None` for events not worth printing
pub fn describe_event(event: &AppEvent) -> Option<String> {
    match event {
        AppEvent::StatusChanged { status } => Some(status.to_string()),
        AppEvent::SessionStarted { session_id, role } => {
            Some(format!("session {} started as {}", session_id, role))
        }
        AppEvent::SessionEnded { session_id, reason } => {
            Some(format!("session {} ended: {}", session_id, reason))
        }
        AppEvent::NegotiationStateChanged { from, to, .. } => {
            Some(format!("negotiation {} -> {}", from, to))
        }
        AppEvent::TextReceived { text, .. } => Some(format!("partner: {}", text)),
        AppEvent::TextSent { text, .. } => Some(format!("me: {}", text)),
        AppEvent::RemoteTrackAdded { track_id, kind } => {
            Some(format!("remote {} track {}", kind, track_id))
        }
        AppEvent::MediaUnavailable { reason } => Some(format!("no local media: {}", reason)),
        AppEvent::InputAvailability { .. } | AppEvent::StatusReport(_) => None,
    }
}
