//! Core types for pairchat sessions
//!
//! Newtypes for the opaque identifiers exchanged with the pairing relay, the
//! role assigned at pairing time, and the monotonic markers used to discard
//! stale asynchronous results.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::PairchatError;

// ----------------------------------------------------------------------------
// Participant Identifier
// ----------------------------------------------------------------------------

/// Opaque token identifying one connecting client for the lifetime of its link
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Wrap an existing token
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    /// Generate a fresh random token
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = PairchatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(PairchatError::config_error("participant id must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Session Identifier
// ----------------------------------------------------------------------------

/// Opaque token assigned by the pairing service to one pairing
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Role
// ----------------------------------------------------------------------------

/// Negotiation role assigned by the pairing service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sends the first offer
    Initiator,
    /// Waits for the remote offer; yields on glare
    Responder,
}

impl Role {
    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

// ----------------------------------------------------------------------------
// Generation and Epoch Markers
// ----------------------------------------------------------------------------

/// Monotonic marker for successive negotiation attempts within one `Negotiator`
///
/// Every asynchronous description call is tagged with the generation current
/// at issue time; a completion whose tag no longer matches is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    pub const INITIAL: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Monotonic marker for successive connection resource instances
///
/// Bumped whenever the controller builds a fresh connection (new session or
/// in-session retry). Events from a connection, its worker, or its timers
/// carry the epoch and are dropped once it is superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SessionEpoch(u64);

impl SessionEpoch {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SessionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_participant_ids_differ() {
        let a = ParticipantId::random();
        let b = ParticipantId::random();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_participant_id_parse() {
        let id: ParticipantId = " abc123 ".parse().unwrap();
        assert_eq!(id.as_str(), "abc123");
        assert!("   ".parse::<ParticipantId>().is_err());
    }

    #[test]
    fn test_generation_is_monotonic() {
        let g = Generation::INITIAL;
        assert!(g.next() > g);
        assert_eq!(g.next().next().value(), 2);
    }

    #[test]
    fn test_duration_since_saturates() {
        let earlier = Timestamp::new(1_000);
        let later = Timestamp::new(3_500);
        assert_eq!(later.duration_since(earlier).as_millis(), 2_500);
        assert_eq!(earlier.duration_since(later).as_millis(), 0);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Initiator).unwrap();
        assert_eq!(json, "\"initiator\"");
        let role: Role = serde_json::from_str("\"responder\"").unwrap();
        assert_eq!(role, Role::Responder);
    }
}
