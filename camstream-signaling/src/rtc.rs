//! [`PeerConnection`] backed by a webrtc-rs `RTCPeerConnection`

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::error::PeerError;
use crate::message::{IceCandidate, SdpKind, SessionDescription};
use crate::peer::{
    EventHandler, GatheringState, IceConnectionState, PeerConnection, PeerEvent, SignalingState,
};

type HandlerSlot = Arc<RwLock<Option<EventHandler>>>;

/// Builds peer connections sharing one configured webrtc API
pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcPeerFactory {
    /// Register the default codecs and interceptors. `stun_servers` may be
    /// empty, in which case only host candidates are gathered.
    pub fn new(stun_servers: &[String]) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }]
        };

        Ok(Self { api, ice_servers })
    }

    pub async fn create(&self) -> Result<Arc<RtcPeer>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        Ok(Arc::new(RtcPeer::new(pc)))
    }
}

/// webrtc-rs peer connection with a swappable event handler
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    handler: HandlerSlot,
}

impl RtcPeer {
    /// Wrap `pc`, registering its callbacks once. Each callback forwards to
    /// whatever handler is installed at the time it fires.
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let handler: HandlerSlot = Arc::new(RwLock::new(None));

        pc.on_negotiation_needed({
            let slot = Arc::clone(&handler);
            Box::new(move || dispatch(&slot, PeerEvent::NegotiationNeeded))
        });

        pc.on_ice_candidate({
            let slot = Arc::clone(&handler);
            Box::new(move |candidate| {
                let candidate = match candidate.map(|c| c.to_json()).transpose() {
                    Ok(candidate) => candidate.map(IceCandidate::from),
                    Err(err) => {
                        debug!(error = %err, "Dropping unserializable local candidate");
                        return async {}.boxed();
                    }
                };
                dispatch(&slot, PeerEvent::LocalCandidate(candidate))
            })
        });

        pc.on_ice_connection_state_change({
            let slot = Arc::clone(&handler);
            Box::new(move |state| match ice_connection_state(state) {
                Some(state) => dispatch(&slot, PeerEvent::IceConnectionState(state)),
                None => async {}.boxed(),
            })
        });

        pc.on_signaling_state_change({
            let slot = Arc::clone(&handler);
            Box::new(move |state| {
                dispatch(&slot, PeerEvent::SignalingState(signaling_state(state)))
            })
        });

        pc.on_ice_gathering_state_change({
            let slot = Arc::clone(&handler);
            Box::new(move |state| match gathering_state(state) {
                Some(state) => dispatch(&slot, PeerEvent::GatheringState(state)),
                None => async {}.boxed(),
            })
        });

        Self { pc, handler }
    }

    /// Send `track` to the viewer. Incoming RTCP for the sender is drained
    /// so the interceptors keep running.
    pub async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), PeerError> {
        let sender = self.pc.add_track(track).await?;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
            trace!("RTCP reader finished");
        });
        Ok(())
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn dispatch(slot: &HandlerSlot, event: PeerEvent) -> BoxFuture<'static, ()> {
    let handler = slot.read().clone();
    match handler {
        Some(handler) => handler(event),
        None => async {}.boxed(),
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        SessionDescription::try_from(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        SessionDescription::try_from(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let description = RTCSessionDescription::try_from(description)?;
        self.pc.set_local_description(description).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = RTCSessionDescription::try_from(description)?;
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    fn set_event_handler(&self, handler: Option<EventHandler>) {
        *self.handler.write() = handler;
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.handler.write().take();
        self.pc.close().await?;
        Ok(())
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = PeerError;

    fn try_from(description: RTCSessionDescription) -> Result<Self, Self::Error> {
        let kind = match description.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            other => return Err(PeerError::InvalidDescription(other.to_string())),
        };
        Ok(Self::new(kind, description.sdp))
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = PeerError;

    fn try_from(description: SessionDescription) -> Result<Self, Self::Error> {
        let result = match description.kind {
            SdpKind::Offer => Self::offer(description.body),
            SdpKind::Answer => Self::answer(description.body),
            SdpKind::Pranswer => Self::pranswer(description.body),
        };
        Ok(result?)
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        // webrtc-rs reports a fresh connection as unspecified
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn ice_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn gathering_state(state: RTCIceGathererState) -> Option<GatheringState> {
    match state {
        RTCIceGathererState::New => Some(GatheringState::New),
        RTCIceGathererState::Gathering => Some(GatheringState::Gathering),
        RTCIceGathererState::Complete => Some(GatheringState::Complete),
        _ => None,
    }
}
