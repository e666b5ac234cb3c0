//! Relay link over the in-memory pairing relay
//!
//! Every message crosses the link as JSON, as it would over a socket. A
//! `LinkController` lets tests drop the connection and make reconnect
//! attempts fail. Reconnection follows the configured `ReconnectPolicy`;
//! when the budget is spent the link reports `RetryExhausted` and stops.

use pairchat_core::{
    channel::{LinkEventSender, OutboundReceiver},
    InboundSignal, LinkEvent, PairchatError, PairchatResult, ReconnectPolicy, SignalingLink,
    TransportError,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::relay::{ConnectionId, PairingRelay};

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkControl {
    Drop { reason: String },
    FailReconnects(u32),
    RefuseReconnects,
}

/// Fault injection for a running `RelayLink`
#[derive(Debug, Clone)]
pub struct LinkController {
    sender: mpsc::UnboundedSender<LinkControl>,
}

impl LinkController {
    /// Drop the relay connection as if the socket closed
    pub fn drop_connection<S: Into<String>>(&self, reason: S) {
        let _ = self.sender.send(LinkControl::Drop {
            reason: reason.into(),
        });
    }

    /// Make the next `count` reconnect attempts fail
    pub fn fail_next_reconnects(&self, count: u32) {
        let _ = self.sender.send(LinkControl::FailReconnects(count));
    }

    /// Make every future reconnect attempt fail
    pub fn refuse_reconnects(&self) {
        let _ = self.sender.send(LinkControl::RefuseReconnects);
    }
}

// ----------------------------------------------------------------------------
// Relay Link
// ----------------------------------------------------------------------------

pub struct RelayLink {
    relay: PairingRelay,
    policy: ReconnectPolicy,
    event_sender: Option<LinkEventSender>,
    outbound_receiver: Option<OutboundReceiver>,
    control_sender: mpsc::UnboundedSender<LinkControl>,
    control_receiver: mpsc::UnboundedReceiver<LinkControl>,
    pending_failures: u32,
    refuse_reconnects: bool,
}

impl RelayLink {
    pub fn new(relay: PairingRelay, policy: ReconnectPolicy) -> Self {
        let (control_sender, control_receiver) = mpsc::unbounded_channel();
        Self {
            relay,
            policy,
            event_sender: None,
            outbound_receiver: None,
            control_sender,
            control_receiver,
            pending_failures: 0,
            refuse_reconnects: false,
        }
    }

    pub fn controller(&self) -> LinkController {
        LinkController {
            sender: self.control_sender.clone(),
        }
    }

    async fn emit(events: &LinkEventSender, event: LinkEvent) -> PairchatResult<()> {
        events
            .send(event)
            .await
            .map_err(|_| PairchatError::channel_error("link event channel closed"))
    }

    fn apply_control(&mut self, control: &LinkControl) {
        match control {
            LinkControl::FailReconnects(count) => self.pending_failures = *count,
            LinkControl::RefuseReconnects => self.refuse_reconnects = true,
            LinkControl::Drop { .. } => {}
        }
    }

    /// Try to reopen the relay connection within the policy's budget
    async fn reconnect(&mut self) -> Option<(ConnectionId, mpsc::UnboundedReceiver<String>)> {
        for attempt in 1..=self.policy.max_attempts {
            tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
            while let Ok(control) = self.control_receiver.try_recv() {
                self.apply_control(&control);
            }
            if self.refuse_reconnects || self.pending_failures > 0 {
                self.pending_failures = self.pending_failures.saturating_sub(1);
                debug!("Relay reconnect attempt {} failed", attempt);
                continue;
            }
            info!("Relay reconnected on attempt {}", attempt);
            return Some(self.relay.connect());
        }
        None
    }
}

#[async_trait::async_trait]
impl SignalingLink for RelayLink {
    fn attach_channels(
        &mut self,
        event_sender: LinkEventSender,
        outbound_receiver: OutboundReceiver,
    ) -> PairchatResult<()> {
        if self.event_sender.is_some() || self.outbound_receiver.is_some() {
            return Err(PairchatError::config_error(
                "relay link channels already attached",
            ));
        }
        self.event_sender = Some(event_sender);
        self.outbound_receiver = Some(outbound_receiver);
        Ok(())
    }

    async fn run(&mut self) -> PairchatResult<()> {
        let events = self.event_sender.clone().ok_or_else(|| {
            PairchatError::config_error("relay link started without attached event sender")
        })?;
        let mut outbound = self.outbound_receiver.take().ok_or_else(|| {
            PairchatError::config_error("relay link started without attached outbound receiver")
        })?;

        info!("Starting relay link");
        let (mut connection, mut inbox) = self.relay.connect();
        Self::emit(&events, LinkEvent::Connected).await?;

        loop {
            let reason = tokio::select! {
                signal = outbound.recv() => {
                    match signal {
                        Some(signal) => {
                            let json = signal.to_json()?;
                            if let Err(e) = self.relay.handle_message(connection, &json) {
                                warn!("Relay rejected {}: {}", signal.name(), e);
                            }
                            continue;
                        }
                        None => {
                            info!("Outbound channel closed, shutting down relay link");
                            self.relay.disconnect(connection);
                            return Ok(());
                        }
                    }
                }

                message = inbox.recv() => {
                    match message {
                        Some(json) => {
                            match InboundSignal::from_json(&json) {
                                Ok(signal) => Self::emit(&events, LinkEvent::Signal(signal)).await?,
                                Err(e) => warn!("Malformed relay message: {}", e),
                            }
                            continue;
                        }
                        None => "relay closed the connection".to_string(),
                    }
                }

                control = self.control_receiver.recv() => {
                    match control {
                        Some(LinkControl::Drop { reason }) => reason,
                        Some(other) => {
                            self.apply_control(&other);
                            continue;
                        }
                        None => continue,
                    }
                }
            };

            warn!("Relay link dropped: {}", reason);
            self.relay.disconnect(connection);
            Self::emit(&events, LinkEvent::Disconnected { reason }).await?;

            match self.reconnect().await {
                Some((id, receiver)) => {
                    connection = id;
                    inbox = receiver;
                    // Messages queued while down are lost, as on a real socket
                    let mut discarded = 0usize;
                    while outbound.try_recv().is_ok() {
                        discarded += 1;
                    }
                    if discarded > 0 {
                        debug!("Discarded {} messages sent while disconnected", discarded);
                    }
                    Self::emit(&events, LinkEvent::Connected).await?;
                }
                None => {
                    let attempts = self.policy.max_attempts;
                    warn!("{}", TransportError::RetryExhausted { attempts });
                    Self::emit(&events, LinkEvent::RetryExhausted { attempts }).await?;
                    return Ok(());
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}
