//! Resource managers owned by the session controller
//!
//! - `connection`: per-session connection object, ordered call worker, track
//!   set, candidate buffer, and teardown

pub mod connection;

pub use connection::{CandidateDisposition, ConnectionOp, ConnectionResources, TeardownReport};
