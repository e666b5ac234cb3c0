//! Pairchat CLI library
//!
//! Runs pairchat engines against an in-process pairing relay: a scripted
//! two-participant demo, and an interactive chat with an echo partner.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::{describe_event, Participant, PairchatApp};
pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use error::{CliError, Result};
