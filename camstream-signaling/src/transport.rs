//! Duplex, ordered, message-framed transport used by a signaling session

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::TransportError;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Peer closed the transport, with its close code if it sent one
    Close(Option<u16>),
}

/// Whether a close code ends a session without error
#[must_use]
pub const fn is_clean_close(code: Option<u16>) -> bool {
    matches!(code, None | Some(CLOSE_NORMAL | CLOSE_GOING_AWAY))
}

#[async_trait]
pub trait TransportReader: Send + 'static {
    /// Next frame, or `None` once the transport has ended.
    ///
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

#[async_trait]
pub trait TransportWriter: Send + 'static {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Writer shared between the message loop and peer callbacks
pub type SharedWriter = Arc<Mutex<Box<dyn TransportWriter>>>;

pub fn shared_writer(writer: impl TransportWriter) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}
