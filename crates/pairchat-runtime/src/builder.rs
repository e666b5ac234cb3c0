//! Engine Builder API
//!
//! Provides a builder-style API for consumers (CLI/tests) to register the
//! relay link, connection factory, and media source, and get command and
//! app-event handles for a running engine.

use std::sync::Arc;

use pairchat_core::{
    channel::{
        create_app_event_channel, create_command_channel, create_engine_event_channel,
        create_link_event_channel, create_outbound_channel, AppEventReceiver, CommandSender,
    },
    Command, EngineConfig, MediaSource, PairchatError, PairchatResult, ParticipantId,
    PeerConnectionFactory, SignalingLink,
};
use tokio::{task::JoinHandle, time::Duration};
use tracing::{info, warn};

use crate::logic::{EngineContext, SessionController};

// ----------------------------------------------------------------------------
// Engine Builder
// ----------------------------------------------------------------------------

/// Builder for a pairchat engine instance
pub struct EngineBuilder {
    participant_id: ParticipantId,
    config: EngineConfig,
    link: Option<Box<dyn SignalingLink>>,
    connection_factory: Option<Arc<dyn PeerConnectionFactory>>,
    media: Option<Arc<dyn MediaSource>>,
    auto_join: bool,
}

impl EngineBuilder {
    pub fn new(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            config: EngineConfig::default(),
            link: None,
            connection_factory: None,
            media: None,
            auto_join: true,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the relay link
    pub fn with_link(mut self, link: Box<dyn SignalingLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_connection_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.connection_factory = Some(factory);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Request a partner every time the relay link connects (default on)
    pub fn auto_join(mut self, enabled: bool) -> Self {
        self.auto_join = enabled;
        self
    }

    /// Build and start the engine
    pub async fn build_and_start(self) -> PairchatResult<EngineHandle> {
        self.config.validate()?;
        let connection_factory = self
            .connection_factory
            .ok_or_else(|| PairchatError::config_error("a peer connection factory is required"))?;

        info!("Building pairchat engine for {}", self.participant_id);

        let channel_config = self.config.channels.clone();
        let (command_sender, command_receiver) = create_command_channel(&channel_config);
        let (app_event_sender, app_event_receiver) = create_app_event_channel(&channel_config);
        let (link_event_sender, link_event_receiver) = create_link_event_channel(&channel_config);
        let (outbound_sender, outbound_receiver) = create_outbound_channel();
        let (internal_sender, internal_receiver) = create_engine_event_channel();

        let link_handle = match self.link {
            Some(mut link) => {
                link.attach_channels(link_event_sender, outbound_receiver)?;
                info!("Starting relay link {}", link.name());
                Some(tokio::spawn(async move { link.run().await }))
            }
            None => {
                warn!("No relay link registered; engine will stay offline");
                None
            }
        };

        let mut context = EngineContext::new(
            self.participant_id.clone(),
            self.config,
            connection_factory,
            self.media,
            internal_sender,
        );
        context.auto_join = self.auto_join;

        let mut controller = SessionController::new(
            context,
            command_receiver,
            link_event_receiver,
            internal_receiver,
            outbound_sender,
            app_event_sender,
        );
        let controller_handle = tokio::spawn(async move { controller.run().await });

        info!("Pairchat engine started");

        Ok(EngineHandle {
            participant_id: self.participant_id,
            command_sender,
            app_event_receiver: Some(app_event_receiver),
            controller_handle: Some(controller_handle),
            link_handle,
            running: true,
        })
    }
}

// ----------------------------------------------------------------------------
// Engine Handle
// ----------------------------------------------------------------------------

/// Handle to a running engine
pub struct EngineHandle {
    participant_id: ParticipantId,
    command_sender: CommandSender,
    app_event_receiver: Option<AppEventReceiver>,
    controller_handle: Option<JoinHandle<PairchatResult<()>>>,
    link_handle: Option<JoinHandle<PairchatResult<()>>>,
    running: bool,
}

impl EngineHandle {
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Get a command sender for the engine
    pub fn command_sender(&self) -> CommandSender {
        self.command_sender.clone()
    }

    /// Take the app event receiver (can only be called once)
    pub fn take_app_event_receiver(&mut self) -> Option<AppEventReceiver> {
        self.app_event_receiver.take()
    }

    pub async fn send_command(&self, command: Command) -> PairchatResult<()> {
        self.command_sender
            .send(command)
            .await
            .map_err(|_| PairchatError::channel_error("Failed to send command to engine"))
    }

    /// Check if the controller is still running
    pub fn is_running(&self) -> bool {
        self.running
            && self
                .controller_handle
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Wait for the controller to stop
    pub async fn wait(&mut self) -> PairchatResult<()> {
        if let Some(handle) = self.controller_handle.take() {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(PairchatError::channel_error(format!(
                    "Session controller panicked: {}",
                    e
                ))),
            }
        } else {
            Ok(())
        }
    }

    /// Shutdown the engine gracefully
    pub async fn shutdown(&mut self) -> PairchatResult<()> {
        info!("Shutting down pairchat engine {}", self.participant_id);

        let _ = self.send_command(Command::Shutdown).await;

        if let Some(handle) = self.controller_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
        }

        // The link flushes the final leave once the outbound channel closes
        if let Some(mut handle) = self.link_handle.take() {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                warn!("Relay link did not stop in time, aborting");
                handle.abort();
            }
        }

        self.running = false;
        info!("Pairchat engine {} shut down", self.participant_id);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Convenience Functions
// ----------------------------------------------------------------------------

/// Create an engine with test configuration
pub async fn create_test_engine(
    participant_id: ParticipantId,
    link: Box<dyn SignalingLink>,
    factory: Arc<dyn PeerConnectionFactory>,
) -> PairchatResult<EngineHandle> {
    EngineBuilder::new(participant_id)
        .with_config(EngineConfig::testing())
        .with_link(link)
        .with_connection_factory(factory)
        .build_and_start()
        .await
}
