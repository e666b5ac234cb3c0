//! Channel Utilities
//!
//! Bounded tokio channels between the UI, the session controller, and the
//! relay link, plus two unbounded queues: the outbound path from the
//! controller to the link, and the internal queue the controller feeds from
//! its own worker, timers, and connection signals.
//!
//! The controller never awaits a send. The link may wait on the bounded
//! link-event channel, so the opposite direction must not wait on the link.

use core::fmt;

use tokio::sync::mpsc;

use crate::channel::communication::{AppEvent, Command, EngineEvent, LinkEvent};
use crate::config::ChannelConfig;
use crate::protocol::OutboundSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    ChannelFull,
    ChannelClosed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::ChannelFull => write!(f, "Channel buffer is full"),
            ChannelError::ChannelClosed => write!(f, "Channel is closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl<T> From<mpsc::error::TrySendError<T>> for ChannelError {
    fn from(err: mpsc::error::TrySendError<T>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => ChannelError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => ChannelError::ChannelClosed,
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Type Definitions
// ----------------------------------------------------------------------------

pub type CommandSender = mpsc::Sender<Command>;
pub type CommandReceiver = mpsc::Receiver<Command>;
pub type LinkEventSender = mpsc::Sender<LinkEvent>;
pub type LinkEventReceiver = mpsc::Receiver<LinkEvent>;
pub type OutboundSender = mpsc::UnboundedSender<OutboundSignal>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutboundSignal>;
pub type AppEventSender = mpsc::Sender<AppEvent>;
pub type AppEventReceiver = mpsc::Receiver<AppEvent>;
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

// ----------------------------------------------------------------------------
// Channel Creation Utilities
// ----------------------------------------------------------------------------

/// Create bounded command channel (UI → controller)
pub fn create_command_channel(config: &ChannelConfig) -> (CommandSender, CommandReceiver) {
    mpsc::channel(config.command_buffer_size)
}

/// Create bounded link event channel (relay link → controller)
pub fn create_link_event_channel(config: &ChannelConfig) -> (LinkEventSender, LinkEventReceiver) {
    mpsc::channel(config.link_event_buffer_size)
}

/// Create the outbound signal channel (controller → relay link)
///
/// Unbounded: the link blocks on the bounded link-event channel while the
/// controller is busy, so a bounded queue here would let each wait on the
/// other forever.
pub fn create_outbound_channel() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// Create bounded app event channel (controller → UI)
pub fn create_app_event_channel(config: &ChannelConfig) -> (AppEventSender, AppEventReceiver) {
    mpsc::channel(config.app_event_buffer_size)
}

/// Create the controller's internal event queue
///
/// Unbounded: producers are the controller's own worker and timers, which must
/// never block on the loop that drains them.
pub fn create_engine_event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}
