//! Signaling wire messages
//!
//! Every frame is a JSON envelope `{"type": ..., "payload": ...}`. Decoding is
//! two-phase: the envelope first, with the payload kept untyped, then the
//! payload according to `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::MessageError;

const SESSION_DESCRIPTION: &str = "session-description";
const ICE_CANDIDATE: &str = "ice-candidate";

/// Description kind as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub body: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Generic envelope with the payload left undecoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(MessageError::Envelope)
    }

    fn ensure_type(&self, expected: &'static str) -> Result<(), MessageError> {
        if self.message_type == expected {
            Ok(())
        } else {
            Err(MessageError::WrongKind {
                expected,
                found: self.message_type.clone(),
            })
        }
    }

    /// Decode the payload of a `session-description` envelope
    pub fn session_description(&self) -> Result<SessionDescription, MessageError> {
        self.ensure_type(SESSION_DESCRIPTION)?;
        SessionDescription::deserialize(&self.payload).map_err(MessageError::Payload)
    }

    /// Decode the payload of an `ice-candidate` envelope; `None` marks the end
    /// of candidates
    pub fn ice_candidate(&self) -> Result<Option<IceCandidate>, MessageError> {
        self.ensure_type(ICE_CANDIDATE)?;
        if self.payload.is_null() {
            return Ok(None);
        }
        IceCandidate::deserialize(&self.payload)
            .map(Some)
            .map_err(MessageError::Payload)
    }
}

/// A decoded signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SessionDescription(SessionDescription),
    IceCandidate(Option<IceCandidate>),
}

impl Message {
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let envelope = Envelope::parse(text)?;
        match envelope.message_type.as_str() {
            SESSION_DESCRIPTION => envelope.session_description().map(Self::SessionDescription),
            ICE_CANDIDATE => envelope.ice_candidate().map(Self::IceCandidate),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        let (message_type, payload) = match self {
            Self::SessionDescription(description) => (
                SESSION_DESCRIPTION,
                serde_json::to_value(description).map_err(MessageError::Encode)?,
            ),
            Self::IceCandidate(candidate) => (
                ICE_CANDIDATE,
                serde_json::to_value(candidate).map_err(MessageError::Encode)?,
            ),
        };

        serde_json::to_string(&Envelope {
            message_type: message_type.to_string(),
            payload,
        })
        .map_err(MessageError::Encode)
    }

    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::SessionDescription(_) => SESSION_DESCRIPTION,
            Self::IceCandidate(_) => ICE_CANDIDATE,
        }
    }
}
