//! GStreamer-backed Media Engine

use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine::{
    BusEvent, BusFilter, ElementHandle, ElementKind, GraphHandle, GraphState, MediaEngine,
    PadHandle, Sample,
};
use crate::error::{EngineError, Result};

const DEFAULT_FRAME_DURATION: Duration = Duration::from_micros(33_333);

#[derive(Default)]
struct Tables {
    next_handle: u64,
    graphs: HashMap<GraphHandle, gst::Pipeline>,
    elements: HashMap<ElementHandle, gst::Element>,
    pads: HashMap<PadHandle, gst::Pad>,
    /// Samples pulled for a caller that stopped waiting
    leftovers: HashMap<ElementHandle, Sample>,
}

impl Tables {
    fn alloc(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn register_pad(&mut self, pad: gst::Pad) -> PadHandle {
        if let Some((handle, _)) = self.pads.iter().find(|(_, known)| **known == pad) {
            return *handle;
        }
        let handle = PadHandle::new(self.alloc());
        self.pads.insert(handle, pad);
        handle
    }

    /// Keep a sample for the next pull on `sink`, unless the sink is gone
    fn stash_leftover(&mut self, sink: ElementHandle, sample: Sample) -> bool {
        if !self.elements.contains_key(&sink) {
            return false;
        }
        self.leftovers.insert(sink, sample);
        true
    }

    fn forget_element(&mut self, element: ElementHandle) -> Option<gst::Element> {
        self.leftovers.remove(&element);
        let removed = self.elements.remove(&element)?;
        self.pads
            .retain(|_, pad| pad.parent_element().as_ref() != Some(&removed));
        Some(removed)
    }
}

const fn to_gst_state(state: GraphState) -> gst::State {
    match state {
        GraphState::Idle => gst::State::Null,
        GraphState::Ready => gst::State::Ready,
        GraphState::Paused => gst::State::Paused,
        GraphState::Playing => gst::State::Playing,
    }
}

fn convert_sample(sample: &gst::Sample) -> Option<Sample> {
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;
    let duration = buffer
        .duration()
        .map_or(DEFAULT_FRAME_DURATION, |d| Duration::from_nanos(d.nseconds()));
    Some(Sample {
        data: Bytes::copy_from_slice(map.as_slice()),
        duration,
    })
}

/// [`MediaEngine`] over real GStreamer pipelines
pub struct GstEngine {
    tables: Arc<Mutex<Tables>>,
    pull_timeout: gst::ClockTime,
}

impl GstEngine {
    /// Initialise GStreamer and create an engine
    pub fn new() -> Result<Self> {
        gst::init().map_err(|e| EngineError::Other(format!("gstreamer init: {e}")))?;
        debug!(version = %gst::version_string(), "GStreamer initialised");

        Ok(Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            pull_timeout: gst::ClockTime::from_mseconds(100),
        })
    }

    fn element(&self, element: ElementHandle) -> Result<gst::Element> {
        self.tables
            .lock()
            .elements
            .get(&element)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandle(element.to_string()))
    }

    fn pad(&self, pad: PadHandle) -> Result<gst::Pad> {
        self.tables
            .lock()
            .pads
            .get(&pad)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandle(pad.to_string()))
    }

    fn pipeline(&self, graph: GraphHandle) -> Result<gst::Pipeline> {
        self.tables
            .lock()
            .graphs
            .get(&graph)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandle(graph.to_string()))
    }

    fn make(kind: &ElementKind, name: &str) -> Result<gst::Element> {
        let built = match kind {
            ElementKind::UriDecodeBin { uri } => gst::ElementFactory::make("uridecodebin")
                .name(name)
                .property("uri", uri.as_str())
                .build(),
            ElementKind::Queue => gst::ElementFactory::make("queue").name(name).build(),
            ElementKind::Vp8Encoder { deadline, cpu_used } => gst::ElementFactory::make("vp8enc")
                .name(name)
                .property("deadline", *deadline)
                .property("cpu-used", *cpu_used)
                .build(),
            ElementKind::Tee { allow_not_linked } => gst::ElementFactory::make("tee")
                .name(name)
                .property("allow-not-linked", *allow_not_linked)
                .build(),
            ElementKind::MultiQueue => gst::ElementFactory::make("multiqueue").name(name).build(),
            ElementKind::AppSink { sync } => Ok(gst_app::AppSink::builder()
                .name(name)
                .sync(*sync)
                .build()
                .upcast()),
        };

        built.map_err(|_| EngineError::ElementCreation {
            factory: kind.factory_name(),
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl MediaEngine for GstEngine {
    fn create_graph(&self, name: &str) -> Result<GraphHandle> {
        let pipeline = gst::Pipeline::with_name(name);
        let mut tables = self.tables.lock();
        let graph = GraphHandle::new(tables.alloc());
        tables.graphs.insert(graph, pipeline);
        Ok(graph)
    }

    fn destroy_graph(&self, graph: GraphHandle) {
        let Some(pipeline) = self.tables.lock().graphs.remove(&graph) else {
            warn!(%graph, "Destroying unknown graph");
            return;
        };
        if let Err(err) = pipeline.set_state(gst::State::Null) {
            warn!(%graph, error = %err, "Failed to stop pipeline");
        }

        let mut tables = self.tables.lock();
        let members: Vec<ElementHandle> = tables
            .elements
            .iter()
            .filter(|(_, element)| {
                element.parent().as_ref() == Some(pipeline.upcast_ref::<gst::Object>())
            })
            .map(|(handle, _)| *handle)
            .collect();
        for element in members {
            tables.forget_element(element);
        }
    }

    fn create_element(&self, kind: &ElementKind, name: &str) -> Result<ElementHandle> {
        let element = Self::make(kind, name)?;
        let mut tables = self.tables.lock();
        let handle = ElementHandle::new(tables.alloc());
        tables.elements.insert(handle, element);
        Ok(handle)
    }

    fn dispose_element(&self, element: ElementHandle) {
        let mut tables = self.tables.lock();
        let parented = tables.elements.get(&element).map(|e| e.parent().is_some());
        match parented {
            Some(false) => {
                tables.forget_element(element);
            }
            Some(true) => warn!(%element, "Refusing to dispose element still in a graph"),
            None => warn!(%element, "Disposing unknown element"),
        }
    }

    fn add_to_graph(&self, graph: GraphHandle, element: ElementHandle) -> bool {
        match (self.pipeline(graph), self.element(element)) {
            (Ok(pipeline), Ok(element)) => pipeline.add(&element).is_ok(),
            _ => false,
        }
    }

    fn remove_from_graph(&self, graph: GraphHandle, element: ElementHandle) -> bool {
        let (Ok(pipeline), Ok(gst_element)) = (self.pipeline(graph), self.element(element)) else {
            return false;
        };
        if let Err(err) = gst_element.set_state(gst::State::Null) {
            warn!(%element, error = %err, "Failed to stop element before removal");
        }
        let removed = pipeline.remove(&gst_element).is_ok();
        if removed {
            self.tables.lock().forget_element(element);
        }
        removed
    }

    fn link_elements(&self, src: ElementHandle, dst: ElementHandle) -> Result<()> {
        let (src, dst) = (self.element(src)?, self.element(dst)?);
        let link_error = || EngineError::Link {
            src: src.name().to_string(),
            dst: dst.name().to_string(),
        };

        if src.static_pad("src").is_some() {
            return src.link(&dst).map_err(|_| link_error());
        }

        // decodebins expose their outputs once the stream is typed
        let downstream = dst.downgrade();
        src.connect_pad_added(move |src, pad| {
            let Some(dst) = downstream.upgrade() else {
                return;
            };
            let Some(sink) = dst.static_pad("sink") else {
                return;
            };
            if sink.is_linked() {
                return;
            }
            let is_video = pad
                .current_caps()
                .and_then(|caps| caps.structure(0).map(|s| s.name().starts_with("video/")))
                .unwrap_or(false);
            if !is_video {
                return;
            }
            match pad.link(&sink) {
                Ok(_) => debug!(src = %src.name(), dst = %dst.name(), "Linked dynamic pad"),
                Err(err) => warn!(src = %src.name(), error = ?err, "Failed to link dynamic pad"),
            }
        });
        Ok(())
    }

    fn request_pad(&self, element: ElementHandle, template: &str) -> Result<PadHandle> {
        let gst_element = self.element(element)?;
        let pad = gst_element
            .request_pad_simple(template)
            .ok_or_else(|| EngineError::PadRequest {
                element: gst_element.name().to_string(),
                template: template.to_string(),
            })?;
        Ok(self.tables.lock().register_pad(pad))
    }

    fn static_pad(&self, element: ElementHandle, name: &str) -> Option<PadHandle> {
        let pad = self.element(element).ok()?.static_pad(name)?;
        Some(self.tables.lock().register_pad(pad))
    }

    fn release_pad(&self, element: ElementHandle, pad: PadHandle) {
        let (Ok(gst_element), Ok(gst_pad)) = (self.element(element), self.pad(pad)) else {
            warn!(%element, %pad, "Releasing unknown pad");
            return;
        };
        gst_element.release_request_pad(&gst_pad);
        self.tables
            .lock()
            .pads
            .retain(|_, known| known.parent().is_some() && *known != gst_pad);
    }

    fn link_pads(&self, src: PadHandle, dst: PadHandle) -> Result<()> {
        let (src, dst) = (self.pad(src)?, self.pad(dst)?);
        src.link(&dst).map(|_| ()).map_err(|_| EngineError::Link {
            src: src.name().to_string(),
            dst: dst.name().to_string(),
        })
    }

    fn unlink_pads(&self, src: PadHandle, dst: PadHandle) -> Result<()> {
        let (src, dst) = (self.pad(src)?, self.pad(dst)?);
        src.unlink(&dst).map_err(|_| EngineError::Unlink {
            src: src.name().to_string(),
            dst: dst.name().to_string(),
        })
    }

    fn set_graph_state(&self, graph: GraphHandle, state: GraphState) -> Result<()> {
        let pipeline = self.pipeline(graph)?;
        pipeline
            .set_state(to_gst_state(state))
            .map(|_| ())
            .map_err(|_| EngineError::StateChange {
                target: pipeline.name().to_string(),
                state,
            })
    }

    fn set_element_state(&self, element: ElementHandle, state: GraphState) -> Result<()> {
        let gst_element = self.element(element)?;
        gst_element
            .set_state(to_gst_state(state))
            .map(|_| ())
            .map_err(|_| EngineError::StateChange {
                target: gst_element.name().to_string(),
                state,
            })
    }

    fn poll_bus(&self, graph: GraphHandle, filter: BusFilter) -> Option<BusEvent> {
        let pipeline = self.pipeline(graph).ok()?;
        let bus = pipeline.bus()?;

        while let Some(message) = bus.pop() {
            let event = match message.view() {
                gst::MessageView::Error(err) => BusEvent::Error {
                    source: err
                        .src()
                        .map(|s| s.path_string().to_string())
                        .unwrap_or_default(),
                    message: err.error().to_string(),
                    debug: err.debug().map(|d| d.to_string()),
                },
                gst::MessageView::Eos(_) => BusEvent::EndOfStream,
                gst::MessageView::Latency(_) => {
                    if let Err(err) = pipeline.recalculate_latency() {
                        warn!(%graph, error = %err, "Failed to recalculate latency");
                    }
                    BusEvent::Latency
                }
                _ => continue,
            };
            if filter.accepts(&event) {
                return Some(event);
            }
        }
        None
    }

    async fn pull_sample(&self, sink: ElementHandle) -> Result<Sample> {
        if let Some(sample) = self.tables.lock().leftovers.remove(&sink) {
            return Ok(sample);
        }

        let appsink = self
            .element(sink)?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| EngineError::UnknownHandle(sink.to_string()))?;

        loop {
            if !self.tables.lock().elements.contains_key(&sink) {
                return Err(EngineError::UnknownHandle(sink.to_string()));
            }
            if appsink.is_eos() {
                return Err(EngineError::EndOfStream);
            }

            let (tx, rx) = oneshot::channel();
            let pulling = appsink.clone();
            let tables = Arc::clone(&self.tables);
            let timeout = self.pull_timeout;
            tokio::task::spawn_blocking(move || {
                let sample = pulling
                    .try_pull_sample(timeout)
                    .and_then(|s| convert_sample(&s));
                if let Err(Some(orphan)) = tx.send(sample) {
                    if !tables.lock().stash_leftover(sink, orphan) {
                        debug!(%sink, "Dropping sample pulled for a removed sink");
                    }
                }
            });

            match rx.await {
                Ok(Some(sample)) => return Ok(sample),
                Ok(None) => continue,
                Err(_) => return Err(EngineError::Other("sample pull task aborted".into())),
            }
        }
    }
}
