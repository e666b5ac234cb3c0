//! Channel Module
//!
//! - `communication`: commands, link events, engine events, app events
//! - `utils`: channel type aliases and constructors

pub mod communication;
pub mod utils;

pub use communication::{
    AppEvent, Command, EngineEvent, EngineSnapshot, EngineStats, EngineStatus, LinkEvent,
};

pub use crate::config::ChannelConfig;

pub use utils::{
    create_app_event_channel, create_command_channel, create_engine_event_channel,
    create_link_event_channel, create_outbound_channel, AppEventReceiver, AppEventSender,
    ChannelError, CommandReceiver, CommandSender, EngineEventReceiver, EngineEventSender,
    LinkEventReceiver, LinkEventSender, OutboundReceiver, OutboundSender,
};
