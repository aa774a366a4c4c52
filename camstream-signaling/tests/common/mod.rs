//! Test doubles for the signaling session: a scripted peer connection and an
//! in-memory transport

#![allow(dead_code)]

use async_trait::async_trait;
use camstream_signaling::{
    shared_writer, EventHandler, Frame, IceCandidate, PeerConnection, PeerError, PeerEvent,
    SdpKind, SessionDescription, SharedWriter, SignalingState, TransportError, TransportReader,
    TransportWriter,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Peer connection that follows the offer/answer state transitions and
/// records every call
#[derive(Default)]
pub struct MockPeer {
    state: Mutex<Option<SignalingState>>,
    calls: Mutex<Vec<String>>,
    candidates: Mutex<Vec<IceCandidate>>,
    handler: Mutex<Option<EventHandler>>,
}

impl MockPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_state(&self, state: SignalingState) {
        *self.state.lock() = Some(state);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Deliver `event` to the installed handler and wait for it to finish
    pub async fn emit(&self, event: PeerEvent) -> bool {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler(event).await;
                true
            }
            None => false,
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap_or(SignalingState::Stable)
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_offer");
        Ok(SessionDescription::new(SdpKind::Offer, "mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_answer");
        Ok(SessionDescription::new(SdpKind::Answer, "mock-answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record(format!("set_local:{}", description.kind));
        let next = match description.kind {
            SdpKind::Offer => SignalingState::HaveLocalOffer,
            SdpKind::Answer => SignalingState::Stable,
            SdpKind::Pranswer => SignalingState::HaveLocalPranswer,
        };
        self.set_state(next);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.record(format!("set_remote:{}", description.kind));
        let next = match description.kind {
            SdpKind::Offer => SignalingState::HaveRemoteOffer,
            SdpKind::Answer => SignalingState::Stable,
            SdpKind::Pranswer => SignalingState::HaveRemotePranswer,
        };
        self.set_state(next);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record("add_ice_candidate");
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn set_event_handler(&self, handler: Option<EventHandler>) {
        *self.handler.lock() = handler;
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record("close");
        self.set_state(SignalingState::Closed);
        Ok(())
    }
}

pub struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl TransportReader for ChannelReader {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportWriter for ChannelWriter {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Viewer end of an in-memory transport
pub struct Viewer {
    pub inbound: mpsc::UnboundedSender<Frame>,
    pub outbound: mpsc::UnboundedReceiver<String>,
}

impl Viewer {
    pub fn send_text(&self, text: impl Into<String>) {
        self.inbound
            .send(Frame::Text(text.into()))
            .expect("session reader dropped");
    }

    pub fn close(&self, code: u16) {
        self.inbound
            .send(Frame::Close(Some(code)))
            .expect("session reader dropped");
    }
}

pub fn transport() -> (Viewer, Box<dyn TransportReader>, SharedWriter) {
    let (inbound, rx) = mpsc::unbounded_channel();
    let (tx, outbound) = mpsc::unbounded_channel();
    let viewer = Viewer { inbound, outbound };
    (viewer, Box::new(ChannelReader { rx }), shared_writer(ChannelWriter { tx }))
}
