use thiserror::Error;

/// Message decoding failures
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// A payload accessor was called on an envelope of another type
    #[error("expected {expected} message, found {found:?}")]
    WrongKind {
        expected: &'static str,
        found: String,
    },

    #[error("malformed payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("could not encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Failures reported by a peer connection
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("unsupported session description type {0}")]
    InvalidDescription(String),

    #[error("peer connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Failures of the message transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// Why a signaling session ended unsuccessfully
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error(transparent)]
    Message(#[from] MessageError),

    /// A description arrived that the current negotiation state cannot accept
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("transport closed with code {0}")]
    AbnormalClose(u16),

    #[error("ice connection failed")]
    ConnectionFailed,
}

pub type Result<T> = std::result::Result<T, SignalingError>;
