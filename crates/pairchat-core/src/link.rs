//! Relay Link Trait Definition
//!
//! Defines the interface for the session-scoped message channel to the pairing
//! relay. Concrete implementations live outside this crate.

use crate::channel::{LinkEventSender, OutboundReceiver};
use crate::Result;

// ----------------------------------------------------------------------------
// Signaling Link Trait
// ----------------------------------------------------------------------------

/// Common interface for relay links
///
/// A link is an independent async task. It:
/// - Delivers `OutboundSignal`s taken from its `OutboundReceiver`
/// - Reports `Connected`/`Disconnected` edges and inbound messages as `LinkEvent`s
/// - Owns its reconnection policy and reports `RetryExhausted` when it gives up
///
/// The engine runtime spawns `run()` and aborts it on shutdown.
#[async_trait::async_trait]
pub trait SignalingLink: Send + Sync {
    /// Attach the channels created by the runtime
    fn attach_channels(
        &mut self,
        event_sender: LinkEventSender,
        outbound_receiver: OutboundReceiver,
    ) -> Result<()>;

    /// Run the link's main loop until shutdown or until it gives up
    async fn run(&mut self) -> Result<()>;

    /// Human-readable name used in logs
    fn name(&self) -> &'static str;
}
