//! Error types for the pairchat engine
//!
//! One enum per failure class the engine distinguishes (transport, negotiation,
//! resource, capability) and the `PairchatError` type that unifies them.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures of the relay link
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Relay link is not connected")]
    NotConnected,
    #[error("Failed to send {message} over relay link: {reason}")]
    SendFailed { message: String, reason: String },
    #[error("Relay link closed: {reason}")]
    LinkClosed { reason: String },
    #[error("Relay link retry budget exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}

/// Failures while producing or applying session descriptions
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("Failed to create local {kind}: {reason}")]
    DescriptionCreationFailed { kind: String, reason: String },
    #[error("Failed to apply {kind} description: {reason}")]
    DescriptionApplicationFailed { kind: String, reason: String },
    #[error("Description call timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Rollback of local offer failed: {reason}")]
    RollbackFailed { reason: String },
    #[error("Connectivity lost: {reason}")]
    ConnectivityLost { reason: String },
}

/// Failures on the negotiated connection object that never abort negotiation
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Failed to apply candidate: {reason}")]
    CandidateRejected { reason: String },
    #[error("Failed to attach track {track_id}: {reason}")]
    TrackAttachFailed { track_id: String, reason: String },
    #[error("Failed to detach track {track_id}: {reason}")]
    TrackDetachFailed { track_id: String, reason: String },
    #[error("Failed to close connection: {reason}")]
    CloseFailed { reason: String },
    #[error("Connection worker stopped")]
    WorkerStopped,
    #[error("Connection factory failed: {reason}")]
    FactoryFailed { reason: String },
}

/// Local media capability failures
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Failed to access camera/microphone: {reason}")]
    MediaUnavailable { reason: String },
    #[error("Media toggle failed: {reason}")]
    ToggleFailed { reason: String },
}

/// Core error type for the pairchat engine
#[derive(Debug, thiserror::Error)]
pub enum PairchatError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("State transition error: {0}")]
    StateTransition(#[from] crate::protocol::StateTransitionError),
    /// Channel communication error between tasks
    #[error("Channel error: {message}")]
    Channel { message: String },
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl PairchatError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        PairchatError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PairchatError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a send failure for the named outbound message
    pub fn send_failed<M: Into<String>, R: Into<String>>(message: M, reason: R) -> Self {
        PairchatError::Transport(TransportError::SendFailed {
            message: message.into(),
            reason: reason.into(),
        })
    }

    pub fn description_creation_failed<K: Into<String>, R: Into<String>>(kind: K, reason: R) -> Self {
        PairchatError::Negotiation(NegotiationError::DescriptionCreationFailed {
            kind: kind.into(),
            reason: reason.into(),
        })
    }

    pub fn description_application_failed<K: Into<String>, R: Into<String>>(
        kind: K,
        reason: R,
    ) -> Self {
        PairchatError::Negotiation(NegotiationError::DescriptionApplicationFailed {
            kind: kind.into(),
            reason: reason.into(),
        })
    }

    pub fn candidate_rejected<R: Into<String>>(reason: R) -> Self {
        PairchatError::Resource(ResourceError::CandidateRejected {
            reason: reason.into(),
        })
    }

    pub fn media_unavailable<R: Into<String>>(reason: R) -> Self {
        PairchatError::Capability(CapabilityError::MediaUnavailable {
            reason: reason.into(),
        })
    }

    /// Whether the controller loop must stop on this error
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            PairchatError::Channel { .. } | PairchatError::Configuration { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, PairchatError>;
pub type PairchatResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
