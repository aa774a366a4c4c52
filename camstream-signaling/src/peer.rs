//! Peer connection abstraction driven by a signaling session

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::error::PeerError;
use crate::message::{IceCandidate, SessionDescription};

/// Negotiation state as reported by the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// Asynchronous notifications raised by the peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    NegotiationNeeded,
    /// A locally gathered candidate, or `None` once gathering is complete
    LocalCandidate(Option<IceCandidate>),
    IceConnectionState(IceConnectionState),
    SignalingState(SignalingState),
    GatheringState(GatheringState),
}

pub type EventHandler = Arc<dyn Fn(PeerEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    fn signaling_state(&self) -> SignalingState;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Route every future event to `handler`; `None` drops the current handler
    fn set_event_handler(&self, handler: Option<EventHandler>);

    async fn close(&self) -> Result<(), PeerError>;
}
