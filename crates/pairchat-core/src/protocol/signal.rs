//! Relay wire schema
//!
//! Messages exchanged with the pairing relay. Both directions are JSON objects
//! tagged by a `type` field, e.g. `{"type":"paired","sessionId":"a-b","role":"initiator"}`.

use serde::{Deserialize, Serialize};

use crate::types::{ParticipantId, Role, SessionId};
use crate::Result;

// ----------------------------------------------------------------------------
// Session Descriptions and Candidates
// ----------------------------------------------------------------------------

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

/// Opaque session description produced by the connection capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer<S: Into<String>>(sdp: S) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer<S: Into<String>>(sdp: S) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpType::Offer
    }
}

/// Network reachability candidate, treated as opaque by the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new<S: Into<String>>(candidate: S) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    #[must_use]
    pub fn with_mid<S: Into<String>>(mut self, mid: S, mline_index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(mline_index);
        self
    }
}

// ----------------------------------------------------------------------------
// Pairing Assignment
// ----------------------------------------------------------------------------

/// Delivered once per session by the pairing service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingAssignment {
    pub session_id: SessionId,
    pub role: Role,
}

// ----------------------------------------------------------------------------
// Outbound Messages (engine → relay)
// ----------------------------------------------------------------------------

/// Messages the engine sends to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundSignal {
    /// Request pairing
    #[serde(rename_all = "camelCase")]
    Join { participant_id: ParticipantId },
    /// Voluntary session exit
    #[serde(rename_all = "camelCase")]
    Leave { participant_id: ParticipantId },
    #[serde(rename_all = "camelCase")]
    Offer {
        participant_id: ParticipantId,
        description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        participant_id: ParticipantId,
        description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Candidate {
        participant_id: ParticipantId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    TextMessage {
        participant_id: ParticipantId,
        text: String,
    },
}

impl OutboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundSignal::Join { .. } => "join",
            OutboundSignal::Leave { .. } => "leave",
            OutboundSignal::Offer { .. } => "offer",
            OutboundSignal::Answer { .. } => "answer",
            OutboundSignal::Candidate { .. } => "candidate",
            OutboundSignal::TextMessage { .. } => "text_message",
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        match self {
            OutboundSignal::Join { participant_id }
            | OutboundSignal::Leave { participant_id }
            | OutboundSignal::Offer { participant_id, .. }
            | OutboundSignal::Answer { participant_id, .. }
            | OutboundSignal::Candidate { participant_id, .. }
            | OutboundSignal::TextMessage { participant_id, .. } => participant_id,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }
}

// ----------------------------------------------------------------------------
// Inbound Messages (relay → engine)
// ----------------------------------------------------------------------------

/// Messages the relay delivers to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundSignal {
    /// No partner yet
    Waiting,
    #[serde(rename_all = "camelCase")]
    Paired { session_id: SessionId, role: Role },
    Offer { description: SessionDescription },
    Answer { description: SessionDescription },
    Candidate { candidate: IceCandidate },
    PartnerLost,
    TextMessage { text: String },
}

impl InboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            InboundSignal::Waiting => "waiting",
            InboundSignal::Paired { .. } => "paired",
            InboundSignal::Offer { .. } => "offer",
            InboundSignal::Answer { .. } => "answer",
            InboundSignal::Candidate { .. } => "candidate",
            InboundSignal::PartnerLost => "partner_lost",
            InboundSignal::TextMessage { .. } => "text_message",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
