//! Per-viewer signaling state machine
//!
//! The message loop applies descriptions and candidates coming from the
//! viewer. Peer callbacks (negotiation needed, local candidates, connectivity
//! changes) run concurrently on their own tasks; both sides write through one
//! shared, locked writer. Whatever ends the session cancels its token, which
//! the loop observes before every read.

use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SignalingError};
use crate::message::{Message, SdpKind, SessionDescription};
use crate::peer::{EventHandler, IceConnectionState, PeerConnection, PeerEvent, SignalingState};
use crate::transport::{is_clean_close, Frame, SharedWriter, TransportReader};

/// Negotiation state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stable,
    HaveLocalOffer,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Shared {
    label: String,
    cancel: CancellationToken,
    cause: Mutex<Option<SignalingError>>,
    state: Mutex<SessionState>,
}

impl Shared {
    /// End the session because of `err`; only the first cause is kept
    fn fail(&self, err: SignalingError) {
        {
            let mut cause = self.cause.lock();
            if cause.is_none() && !self.cancel.is_cancelled() {
                warn!(session = %self.label, error = %err, "Signaling session failed");
                *cause = Some(err);
            }
        }
        self.cancel.cancel();
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != SessionState::Closed {
            debug!(session = %self.label, from = %*current, to = %state, "Session state changed");
            *current = state;
        }
    }
}

/// Observer and remote control for a running session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// End the session as if the viewer had left
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// State shared with peer callbacks
#[derive(Clone)]
struct EventContext {
    peer: Weak<dyn PeerConnection>,
    writer: SharedWriter,
    shared: Arc<Shared>,
}

impl EventContext {
    async fn on_event(&self, event: PeerEvent) {
        if self.shared.cancel.is_cancelled() {
            return;
        }

        match event {
            PeerEvent::NegotiationNeeded => {
                let Some(peer) = self.peer.upgrade() else {
                    return;
                };
                if let Err(err) = self.negotiate(peer.as_ref()).await {
                    self.shared.fail(err);
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                if candidate.is_none() {
                    debug!(session = %self.shared.label, "Local candidate gathering complete");
                }
                if let Err(err) = send(&self.writer, &Message::IceCandidate(candidate)).await {
                    self.shared.fail(err);
                }
            }
            PeerEvent::IceConnectionState(state) => {
                debug!(session = %self.shared.label, ?state, "ICE connection state changed");
                match state {
                    IceConnectionState::Failed => self.shared.fail(SignalingError::ConnectionFailed),
                    IceConnectionState::Closed => self.shared.cancel.cancel(),
                    IceConnectionState::Connected => {
                        info!(session = %self.shared.label, "Viewer connected");
                    }
                    _ => {}
                }
            }
            PeerEvent::SignalingState(state) => {
                debug!(session = %self.shared.label, ?state, "Signaling state changed");
            }
            PeerEvent::GatheringState(state) => {
                debug!(session = %self.shared.label, ?state, "ICE gathering state changed");
            }
        }
    }

    async fn negotiate(&self, peer: &dyn PeerConnection) -> Result<()> {
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.shared.set_state(SessionState::HaveLocalOffer);
        send(&self.writer, &Message::SessionDescription(offer)).await
    }
}

async fn send(writer: &SharedWriter, message: &Message) -> Result<()> {
    let text = message.encode()?;
    writer.lock().await.send(text).await?;
    Ok(())
}

/// Applies viewer messages to the peer connection
struct Negotiator {
    peer: Arc<dyn PeerConnection>,
    writer: SharedWriter,
    shared: Arc<Shared>,
}

impl Negotiator {
    async fn handle_message(&self, message: Message) -> Result<()> {
        match message {
            Message::SessionDescription(description) => {
                self.handle_description(description).await
            }
            Message::IceCandidate(Some(candidate)) => {
                self.peer.add_ice_candidate(candidate).await?;
                Ok(())
            }
            Message::IceCandidate(None) => {
                debug!(session = %self.shared.label, "Viewer finished sending candidates");
                Ok(())
            }
        }
    }

    async fn handle_description(&self, description: SessionDescription) -> Result<()> {
        let state = self.peer.signaling_state();
        match (state, description.kind) {
            (SignalingState::HaveLocalOffer, SdpKind::Answer | SdpKind::Pranswer) => {
                self.peer.set_remote_description(description).await?;
                self.shared.set_state(SessionState::Stable);
                Ok(())
            }
            (SignalingState::Stable, SdpKind::Offer) => {
                self.peer.set_remote_description(description).await?;
                let answer = self.peer.create_answer().await?;
                self.peer.set_local_description(answer.clone()).await?;
                send(&self.writer, &Message::SessionDescription(answer)).await
            }
            (state, kind) => Err(SignalingError::Protocol(format!(
                "unexpected {kind} in signaling state {state:?}"
            ))),
        }
    }
}

/// One viewer's negotiation, from first message to teardown
pub struct SignalingSession {
    reader: Box<dyn TransportReader>,
    negotiator: Negotiator,
}

impl SignalingSession {
    /// Create a session and start listening to peer events.
    ///
    /// Events raised before [`Self::run`] (e.g. negotiation needed after a
    /// track is added) are already handled.
    pub fn new(
        label: impl Into<String>,
        peer: Arc<dyn PeerConnection>,
        reader: Box<dyn TransportReader>,
        writer: SharedWriter,
    ) -> Self {
        let shared = Arc::new(Shared {
            label: label.into(),
            cancel: CancellationToken::new(),
            cause: Mutex::new(None),
            state: Mutex::new(SessionState::Stable),
        });

        let context = EventContext {
            peer: Arc::downgrade(&peer),
            writer: Arc::clone(&writer),
            shared: Arc::clone(&shared),
        };
        let handler: EventHandler = Arc::new(move |event| {
            let context = context.clone();
            async move { context.on_event(event).await }.boxed()
        });
        peer.set_event_handler(Some(handler));

        Self {
            reader,
            negotiator: Negotiator {
                peer,
                writer,
                shared,
            },
        }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.negotiator.shared),
        }
    }

    /// Run until the transport closes, the peer fails, or a protocol error.
    ///
    /// Clean closes return `Ok`. The peer connection itself is left open for
    /// the caller to close.
    pub async fn run(mut self) -> Result<()> {
        let result = self.message_loop().await;

        let shared = &self.negotiator.shared;
        self.negotiator.peer.set_event_handler(None);
        shared.cancel.cancel();
        *shared.state.lock() = SessionState::Closed;

        let cause = shared.cause.lock().take();
        match (cause, result) {
            (Some(cause), _) => Err(cause),
            (None, Err(err)) => {
                warn!(session = %shared.label, error = %err, "Signaling session failed");
                Err(err)
            }
            (None, Ok(())) => {
                debug!(session = %shared.label, "Signaling session ended");
                Ok(())
            }
        }
    }

    async fn message_loop(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.negotiator.shared);
        loop {
            let frame = tokio::select! {
                biased;
                () = shared.cancel.cancelled() => return Ok(()),
                frame = self.reader.recv() => frame,
            };

            match frame {
                None => {
                    debug!(session = %shared.label, "Transport ended");
                    return Ok(());
                }
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(Frame::Close(code))) => {
                    if is_clean_close(code) {
                        debug!(session = %shared.label, ?code, "Viewer closed the transport");
                        return Ok(());
                    }
                    return Err(SignalingError::AbnormalClose(code.unwrap_or_default()));
                }
                Some(Ok(Frame::Text(text))) => {
                    let message = Message::decode(&text)?;
                    self.negotiator.handle_message(message).await?;
                }
            }
        }
    }
}
