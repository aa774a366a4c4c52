//! Per-stream bus monitor

use camstream_media::{BusEvent, BusFilter, GraphHandle, MediaEngine};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::types::StreamId;

/// Callback invoked for every bus event a stream observes
pub type BusHandler = Arc<dyn Fn(&StreamId, &BusEvent) + Send + Sync>;

pub(crate) struct BusMonitor {
    pub engine: Arc<dyn MediaEngine>,
    pub graph: GraphHandle,
    pub stream_id: StreamId,
    pub handler: Arc<RwLock<Option<BusHandler>>>,
    pub healthy: Arc<AtomicBool>,
    pub interval: Duration,
    pub cancel: CancellationToken,
}

impl BusMonitor {
    /// Poll the bus until cancelled or a fatal event arrives.
    ///
    /// Never touches the stream's topology lock.
    pub async fn run(self) {
        loop {
            while let Some(event) = self.engine.poll_bus(self.graph, BusFilter::ALL) {
                match &event {
                    BusEvent::Error {
                        source,
                        message,
                        debug: detail,
                    } => error!(
                        stream_id = %self.stream_id,
                        %source,
                        %message,
                        debug = detail.as_deref().unwrap_or_default(),
                        "Media graph error"
                    ),
                    BusEvent::EndOfStream => info!(stream_id = %self.stream_id, "Media graph reached end of stream"),
                    BusEvent::Latency => debug!(stream_id = %self.stream_id, "Media graph latency changed"),
                }

                let handler = self.handler.read().clone();
                if let Some(handler) = handler {
                    handler(&self.stream_id, &event);
                }

                if event.is_fatal() {
                    self.healthy.store(false, Ordering::Release);
                    return;
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
