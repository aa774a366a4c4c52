//! Stream registry
//!
//! Streams are created once per camera, either at startup from the static
//! camera list or on first access through a lookup. A per-id creation lock
//! makes concurrent first accesses share one graph.

use camstream_core::{CameraConfig, EncoderConfig, FanoutConfig};
use camstream_media::{BusEvent, MediaEngine};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bus::BusHandler;
use crate::error::{Result, StreamError};
use crate::stream::Stream;
use crate::types::{StreamId, StreamInfo};

pub struct StreamManager {
    engine: Arc<dyn MediaEngine>,
    encoder: EncoderConfig,
    fanout: FanoutConfig,
    streams: DashMap<StreamId, Arc<Stream>>,
    creation_locks: DashMap<StreamId, Arc<tokio::sync::Mutex<()>>>,
    bus_handler: RwLock<Option<BusHandler>>,
}

impl StreamManager {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, encoder: EncoderConfig, fanout: FanoutConfig) -> Self {
        Self {
            engine,
            encoder,
            fanout,
            streams: DashMap::new(),
            creation_locks: DashMap::new(),
            bus_handler: RwLock::new(None),
        }
    }

    /// Handler installed on every stream this manager creates from now on,
    /// whether registered up front or on first access
    pub fn on_bus_event<F>(&self, handler: F)
    where
        F: Fn(&StreamId, &BusEvent) + Send + Sync + 'static,
    {
        *self.bus_handler.write() = Some(Arc::new(handler));
    }

    /// Create and register a stream for `camera`
    pub fn register(&self, camera: &CameraConfig) -> Result<Arc<Stream>> {
        let id = StreamId::new(camera.id.clone());
        match self.insert_new(camera)? {
            (stream, true) => Ok(stream),
            (_, false) => Err(StreamError::AlreadyRegistered(id)),
        }
    }

    /// Build and insert a stream unless one is already registered under the
    /// camera id. The flag is false when the existing stream was returned.
    fn insert_new(&self, camera: &CameraConfig) -> Result<(Arc<Stream>, bool)> {
        match self.streams.entry(StreamId::new(camera.id.clone())) {
            Entry::Occupied(entry) => Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => {
                let stream = Stream::new(Arc::clone(&self.engine), camera, &self.encoder, &self.fanout)?;
                if let Some(handler) = self.bus_handler.read().clone() {
                    stream.set_bus_handler(handler);
                }
                entry.insert(Arc::clone(&stream));
                Ok((stream, true))
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams
            .get(&StreamId::from(id))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Return the registered stream, or resolve the camera with `lookup` and
    /// create it.
    ///
    /// `lookup` returning `None` means the camera does not exist.
    pub async fn get_or_create<F, Fut>(&self, id: &str, lookup: F) -> Result<Arc<Stream>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<CameraConfig>>>,
    {
        if let Some(stream) = self.get(id) {
            return Ok(stream);
        }

        let stream_id = StreamId::from(id);
        let lock = Arc::clone(
            self.creation_locks
                .entry(stream_id.clone())
                .or_default()
                .value(),
        );

        let result = {
            let _guard = lock.lock().await;
            // another caller may have created it while we waited
            match self.get(id) {
                Some(stream) => Ok(stream),
                None => self.create_on_first_access(&stream_id, lookup).await,
            }
        };

        // waiters still hold a clone, so the entry outlives them
        drop(lock);
        self.creation_locks
            .remove_if(&stream_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn create_on_first_access<F, Fut>(&self, stream_id: &StreamId, lookup: F) -> Result<Arc<Stream>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<CameraConfig>>>,
    {
        match lookup(stream_id.to_string()).await? {
            Some(mut camera) => {
                camera.id = stream_id.to_string();
                debug!(stream_id = %stream_id, "Creating stream on first access");
                self.insert_new(&camera).map(|(stream, _)| stream)
            }
            None => Err(StreamError::StreamNotFound(stream_id.clone())),
        }
    }

    /// Number of per-id creation locks currently held in the registry
    #[must_use]
    pub fn pending_creations(&self) -> usize {
        self.creation_locks.len()
    }

    /// Snapshot of every stream, ordered by id
    #[must_use]
    pub fn list(&self) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = self.streams.iter().map(|entry| entry.value().info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Unregister a stream and release its graph
    pub async fn remove(&self, id: &str) -> Result<()> {
        let stream_id = StreamId::from(id);
        let (_, stream) = self
            .streams
            .remove(&stream_id)
            .ok_or(StreamError::StreamNotFound(stream_id))?;
        stream.shutdown().await;
        Ok(())
    }

    /// Shut down every stream
    pub async fn shutdown(&self) {
        let streams: Vec<Arc<Stream>> = self.streams.iter().map(|e| Arc::clone(e.value())).collect();
        self.streams.clear();

        for stream in &streams {
            stream.shutdown().await;
        }
        info!(streams = streams.len(), "Stream manager shut down");
    }
}
