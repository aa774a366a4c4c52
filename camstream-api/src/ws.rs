//! WebSocket adapter for the signaling transport
//!
//! Generic over the split halves so tests can drive it with in-memory
//! streams and sinks.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message};
use camstream_signaling::{Frame, TransportError, TransportReader, TransportWriter};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;

/// Receiving half of a signaling WebSocket
pub struct WsReader<S> {
    inner: S,
}

impl<S> WsReader<S> {
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S, E> TransportReader for WsReader<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(Message::Close(frame)) => {
                    return Some(Ok(Frame::Close(frame.map(|frame| frame.code))));
                }
                Ok(Message::Binary(_)) => {
                    return Some(Err(TransportError::Io(
                        "binary frames are not supported".to_string(),
                    )));
                }
                // ping and pong are answered by the server
                Ok(_) => {}
                Err(err) => return Some(Err(TransportError::Io(err.to_string()))),
            }
        }
    }
}

/// Sending half of a signaling WebSocket
pub struct WsWriter<S> {
    inner: S,
}

impl<S> WsWriter<S> {
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> TransportWriter for WsWriter<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        self.inner
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        self.inner
            .close()
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }
}
