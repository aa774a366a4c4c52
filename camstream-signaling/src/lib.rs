//! camstream viewer signaling
//!
//! Negotiates one WebRTC peer connection per viewer over a message transport
//! carrying JSON envelopes.
//!
//! ## Architecture
//!
//! - **`Message`**: wire codec for session descriptions and ICE candidates
//! - **`PeerConnection`**: the peer connection seam, implemented by `RtcPeer`
//! - **`SignalingSession`**: the per-viewer state machine, driven by a
//!   `TransportReader` and writing through a `SharedWriter`

mod error;
mod message;
mod peer;
mod rtc;
mod session;
mod transport;

pub use error::{MessageError, PeerError, Result, SignalingError, TransportError};
pub use message::{Envelope, IceCandidate, Message, SdpKind, SessionDescription};
pub use peer::{
    EventHandler, GatheringState, IceConnectionState, PeerConnection, PeerEvent, SignalingState,
};
pub use rtc::{RtcPeer, RtcPeerFactory};
pub use session::{SessionHandle, SessionState, SignalingSession};
pub use transport::{
    is_clean_close, shared_writer, Frame, SharedWriter, TransportReader, TransportWriter,
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
};
