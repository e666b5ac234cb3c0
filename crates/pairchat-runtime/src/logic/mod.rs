//! Session Controller Module
//!
//! The session lifecycle controller split into focused components:
//! - `state`: `EngineContext`, the single owned state of one engine
//! - `handlers`: one handler per `EngineEvent`
//! - `task`: the `SessionController` loop and error classification
//!
//! ## Serialization Point
//!
//! Every input (UI commands, relay messages, worker completions, connection
//! signals, timers) reaches the controller as an `EngineEvent` and is handled
//! to completion before the next one. Races between a pairing assignment, a
//! late description result, and a partner loss are therefore resolved by event
//! order plus the epoch and generation tags carried by asynchronous results.

pub mod handlers;
pub mod state;
pub mod task;

pub use handlers::{HandlerOutput, SessionHandlers};
pub use state::{ActiveSession, EngineContext, PairingPhase, TransportPhase};
pub use task::SessionController;
