//! Pairchat Runtime Engine
//!
//! The engine that takes two matched participants from "just paired" to a
//! stable negotiated connection and back down again:
//! - `SessionController`: the session lifecycle controller and its event loop
//! - `ConnectionResources`: per-session connection object, ordered call worker,
//!   track set, candidate buffer, and teardown
//! - `EngineBuilder` / `EngineHandle`: wiring and the outward control surface
//!
//! `pairchat-core` provides the stable API definitions and the negotiation
//! state machine this crate drives.

pub mod builder;
pub mod logic;
pub mod managers;

pub use builder::{create_test_engine, EngineBuilder, EngineHandle};
pub use logic::{EngineContext, SessionController};
pub use managers::*;

// Re-export core types for convenience
pub use pairchat_core::{
    channel::{
        create_app_event_channel, create_command_channel, AppEventReceiver, AppEventSender,
        ChannelError, CommandReceiver, CommandSender,
    },
    AppEvent, Command, EngineConfig, EngineSnapshot, EngineStatus, PairchatError, PairchatResult,
    ParticipantId, SignalingLink,
};
