//! In-process Media Engine
//!
//! Keeps graphs, elements and pads in handle-indexed tables and simulates
//! just enough dataflow for the fan-out layer: sources synthesise frames while
//! their graph plays, and every playing app sink whose input chain reaches a
//! tee receives a copy through its own bounded queue. A full queue drops the
//! frame for that sink only.
//!
//! Every mutating call is appended to an ordered call log, and failures can be
//! injected per operation, which makes the engine usable as an instrumented
//! test double as well as a stand-in when no real pipeline library is wanted.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::engine::{
    BusEvent, BusFilter, ElementHandle, ElementKind, GraphHandle, GraphState, MediaEngine,
    PadHandle, Sample,
};
use crate::error::{EngineError, Result};

/// Engine operations, as recorded in the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateGraph,
    DestroyGraph,
    CreateElement,
    DisposeElement,
    AddToGraph,
    RemoveFromGraph,
    LinkElements,
    RequestPad,
    ReleasePad,
    LinkPads,
    UnlinkPads,
    SetGraphState,
    SetElementState,
}

/// One entry of the call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub op: Operation,
    /// Human readable subject, e.g. `cam-1-tee.src_0->cam-1-multiqueue.sink_0`
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct MemoryEngineConfig {
    /// Frame rate of synthetic sources; `None` disables frame generation
    pub test_framerate: Option<u32>,
    /// Samples buffered per app sink before frames are dropped
    pub sink_queue_capacity: usize,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self {
            test_framerate: None,
            sink_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Src,
    Sink,
}

struct PadEntry {
    element: ElementHandle,
    name: String,
    direction: Direction,
    requested: bool,
    peer: Option<PadHandle>,
}

struct SinkQueue {
    tx: mpsc::Sender<Sample>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Sample>>>,
}

struct ElementEntry {
    kind: ElementKind,
    name: String,
    state: GraphState,
    graph: Option<GraphHandle>,
    pads: BTreeMap<String, PadHandle>,
    next_request_index: u32,
    sink: Option<SinkQueue>,
}

struct GraphEntry {
    name: String,
    state: GraphState,
    elements: BTreeSet<ElementHandle>,
    bus: VecDeque<BusEvent>,
    generator: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    next_handle: u64,
    graphs: HashMap<GraphHandle, GraphEntry>,
    elements: HashMap<ElementHandle, ElementEntry>,
    pads: HashMap<PadHandle, PadEntry>,
    calls: Vec<EngineCall>,
    pads_requested: usize,
    pads_released: usize,
    failures: HashMap<Operation, usize>,
}

impl Inner {
    fn alloc(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Record the call and report whether an injected failure should fire
    fn record(&mut self, op: Operation, target: String) -> bool {
        self.calls.push(EngineCall { op, target });
        match self.failures.get_mut(&op) {
            Some(pending) if *pending > 0 => {
                *pending -= 1;
                true
            }
            _ => false,
        }
    }

    fn element_name(&self, element: ElementHandle) -> String {
        self.elements
            .get(&element)
            .map_or_else(|| element.to_string(), |e| e.name.clone())
    }

    fn graph_name(&self, graph: GraphHandle) -> String {
        self.graphs
            .get(&graph)
            .map_or_else(|| graph.to_string(), |g| g.name.clone())
    }

    fn pad_name(&self, pad: PadHandle) -> String {
        self.pads.get(&pad).map_or_else(
            || pad.to_string(),
            |p| format!("{}.{}", self.element_name(p.element), p.name),
        )
    }

    fn add_pad(
        &mut self,
        element: ElementHandle,
        name: &str,
        direction: Direction,
        requested: bool,
    ) -> PadHandle {
        let pad = PadHandle::new(self.alloc());
        self.pads.insert(
            pad,
            PadEntry {
                element,
                name: name.to_string(),
                direction,
                requested,
                peer: None,
            },
        );
        if let Some(entry) = self.elements.get_mut(&element) {
            entry.pads.insert(name.to_string(), pad);
        }
        pad
    }

    fn drop_pad(&mut self, pad: PadHandle) {
        if let Some(entry) = self.pads.remove(&pad) {
            if let Some(peer) = entry.peer {
                if let Some(peer_entry) = self.pads.get_mut(&peer) {
                    peer_entry.peer = None;
                }
            }
            if let Some(element) = self.elements.get_mut(&entry.element) {
                element.pads.remove(&entry.name);
            }
        }
    }

    fn link(&mut self, src: PadHandle, dst: PadHandle) -> Result<()> {
        let link_error = |inner: &Self| EngineError::Link {
            src: inner.pad_name(src),
            dst: inner.pad_name(dst),
        };

        let valid = match (self.pads.get(&src), self.pads.get(&dst)) {
            (Some(s), Some(d)) => {
                s.direction == Direction::Src
                    && d.direction == Direction::Sink
                    && s.peer.is_none()
                    && d.peer.is_none()
            }
            _ => false,
        };
        if !valid {
            return Err(link_error(self));
        }

        if let Some(s) = self.pads.get_mut(&src) {
            s.peer = Some(dst);
        }
        if let Some(d) = self.pads.get_mut(&dst) {
            d.peer = Some(src);
        }
        Ok(())
    }

    fn free_element(&mut self, element: ElementHandle) {
        let Some(entry) = self.elements.get(&element) else {
            return;
        };
        let pads: Vec<PadHandle> = entry.pads.values().copied().collect();
        for pad in pads {
            self.drop_pad(pad);
        }
        // dropping the entry closes the sink queue, waking any puller with EOS
        self.elements.remove(&element);
    }

    /// Whether the input of `sink` is fed, possibly through a multiqueue, by a tee
    fn reaches_tee(&self, sink: &ElementEntry) -> bool {
        let upstream = sink
            .pads
            .get("sink")
            .and_then(|pad| self.pads.get(pad))
            .and_then(|pad| pad.peer)
            .and_then(|peer| self.pads.get(&peer));
        let Some(upstream) = upstream else {
            return false;
        };
        let Some(owner) = self.elements.get(&upstream.element) else {
            return false;
        };

        match owner.kind {
            ElementKind::Tee { .. } => true,
            ElementKind::MultiQueue => {
                let paired = upstream.name.replacen("src_", "sink_", 1);
                owner
                    .pads
                    .get(&paired)
                    .and_then(|pad| self.pads.get(pad))
                    .and_then(|pad| pad.peer)
                    .and_then(|peer| self.pads.get(&peer))
                    .and_then(|peer| self.elements.get(&peer.element))
                    .is_some_and(|e| matches!(e.kind, ElementKind::Tee { .. }))
            }
            _ => false,
        }
    }

    fn deliver(&self, graph: GraphHandle, sample: &Sample) -> usize {
        let Some(entry) = self.graphs.get(&graph) else {
            return 0;
        };
        if entry.state != GraphState::Playing {
            return 0;
        }

        let mut delivered = 0;
        for element in &entry.elements {
            let Some(sink) = self.elements.get(element) else {
                continue;
            };
            let Some(queue) = &sink.sink else {
                continue;
            };
            if sink.state != GraphState::Playing || !self.reaches_tee(sink) {
                continue;
            }
            match queue.tx.try_send(sample.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(sink = %sink.name, "Sink queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}

fn synthetic_frame(sequence: u64) -> Bytes {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(b"TEST");
    data.extend_from_slice(&sequence.to_be_bytes());
    Bytes::from(data)
}

/// In-process, instrumented [`MediaEngine`]
pub struct MemoryEngine {
    inner: Arc<Mutex<Inner>>,
    config: MemoryEngineConfig,
}

impl MemoryEngine {
    /// Engine without frame generation; samples only flow through [`Self::push_sample`]
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryEngineConfig::default())
    }

    #[must_use]
    pub fn with_config(config: MemoryEngineConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            config,
        }
    }

    /// Make the next `op` call fail
    pub fn fail_next(&self, op: Operation) {
        *self.inner.lock().failures.entry(op).or_insert(0) += 1;
    }

    /// Snapshot of every mutating call so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// `(requested, released)` counts of request pads
    #[must_use]
    pub fn pad_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.pads_requested, inner.pads_released)
    }

    #[must_use]
    pub fn outstanding_request_pads(&self) -> usize {
        let (requested, released) = self.pad_counts();
        requested - released
    }

    #[must_use]
    pub fn graph_by_name(&self, name: &str) -> Option<GraphHandle> {
        self.inner
            .lock()
            .graphs
            .iter()
            .find(|(_, g)| g.name == name)
            .map(|(handle, _)| *handle)
    }

    #[must_use]
    pub fn graph_state(&self, graph: GraphHandle) -> Option<GraphState> {
        self.inner.lock().graphs.get(&graph).map(|g| g.state)
    }

    #[must_use]
    pub fn element_state(&self, element: ElementHandle) -> Option<GraphState> {
        self.inner.lock().elements.get(&element).map(|e| e.state)
    }

    #[must_use]
    pub fn graph_element_count(&self, graph: GraphHandle) -> usize {
        self.inner
            .lock()
            .graphs
            .get(&graph)
            .map_or(0, |g| g.elements.len())
    }

    /// Live elements across all graphs, including unparented ones
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.inner.lock().elements.len()
    }

    #[must_use]
    pub fn graph_count(&self) -> usize {
        self.inner.lock().graphs.len()
    }

    #[must_use]
    pub fn is_linked(&self, pad: PadHandle) -> bool {
        self.inner
            .lock()
            .pads
            .get(&pad)
            .is_some_and(|p| p.peer.is_some())
    }

    /// Feed one sample into the graph's shared chain, returning how many
    /// sinks accepted it
    pub fn push_sample(&self, graph: GraphHandle, sample: &Sample) -> usize {
        self.inner.lock().deliver(graph, sample)
    }

    pub fn post_bus_event(&self, graph: GraphHandle, event: BusEvent) {
        if let Some(entry) = self.inner.lock().graphs.get_mut(&graph) {
            entry.bus.push_back(event);
        }
    }

    fn spawn_generator(&self, graph: GraphHandle, framerate: u32) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let frame = Duration::from_secs(1) / framerate.max(1);

        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(frame);
            let mut sequence = 0u64;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let sample = Sample {
                    data: synthetic_frame(sequence),
                    duration: frame,
                };
                sequence += 1;
                inner.lock().deliver(graph, &sample);
            }
        }))
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        for graph in self.inner.lock().graphs.values_mut() {
            if let Some(generator) = graph.generator.take() {
                generator.abort();
            }
        }
    }
}

#[async_trait]
impl MediaEngine for MemoryEngine {
    fn create_graph(&self, name: &str) -> Result<GraphHandle> {
        let mut inner = self.inner.lock();
        if inner.record(Operation::CreateGraph, name.to_string()) {
            return Err(EngineError::GraphCreation(name.to_string()));
        }
        let graph = GraphHandle::new(inner.alloc());
        inner.graphs.insert(
            graph,
            GraphEntry {
                name: name.to_string(),
                state: GraphState::Idle,
                elements: BTreeSet::new(),
                bus: VecDeque::new(),
                generator: None,
            },
        );
        Ok(graph)
    }

    fn destroy_graph(&self, graph: GraphHandle) {
        let mut inner = self.inner.lock();
        let target = inner.graph_name(graph);
        inner.record(Operation::DestroyGraph, target);

        let Some(mut entry) = inner.graphs.remove(&graph) else {
            warn!(%graph, "Destroying unknown graph");
            return;
        };
        if let Some(generator) = entry.generator.take() {
            generator.abort();
        }
        for element in entry.elements {
            inner.free_element(element);
        }
        debug!(graph = %entry.name, "Graph destroyed");
    }

    fn create_element(&self, kind: &ElementKind, name: &str) -> Result<ElementHandle> {
        let mut inner = self.inner.lock();
        if inner.record(Operation::CreateElement, name.to_string()) {
            return Err(EngineError::ElementCreation {
                factory: kind.factory_name(),
                name: name.to_string(),
            });
        }

        let element = ElementHandle::new(inner.alloc());
        let sink = matches!(kind, ElementKind::AppSink { .. }).then(|| {
            let (tx, rx) = mpsc::channel(self.config.sink_queue_capacity.max(1));
            SinkQueue {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        inner.elements.insert(
            element,
            ElementEntry {
                kind: kind.clone(),
                name: name.to_string(),
                state: GraphState::Idle,
                graph: None,
                pads: BTreeMap::new(),
                next_request_index: 0,
                sink,
            },
        );

        let static_pads: &[(&str, Direction)] = match kind {
            ElementKind::UriDecodeBin { .. } => &[("src", Direction::Src)],
            ElementKind::Queue | ElementKind::Vp8Encoder { .. } => {
                &[("sink", Direction::Sink), ("src", Direction::Src)]
            }
            ElementKind::Tee { .. } | ElementKind::AppSink { .. } => &[("sink", Direction::Sink)],
            ElementKind::MultiQueue => &[],
        };
        for (pad_name, direction) in static_pads {
            inner.add_pad(element, pad_name, *direction, false);
        }

        Ok(element)
    }

    fn dispose_element(&self, element: ElementHandle) {
        let mut inner = self.inner.lock();
        let target = inner.element_name(element);
        inner.record(Operation::DisposeElement, target);

        match inner.elements.get(&element).map(|e| e.graph) {
            Some(None) => inner.free_element(element),
            Some(Some(graph)) => warn!(%element, %graph, "Refusing to dispose element still in a graph"),
            None => warn!(%element, "Disposing unknown element"),
        }
    }

    fn add_to_graph(&self, graph: GraphHandle, element: ElementHandle) -> bool {
        let mut inner = self.inner.lock();
        let target = format!("{}+{}", inner.graph_name(graph), inner.element_name(element));
        if inner.record(Operation::AddToGraph, target) {
            return false;
        }
        if !inner.graphs.contains_key(&graph) {
            return false;
        }
        match inner.elements.get_mut(&element) {
            Some(entry) if entry.graph.is_none() => entry.graph = Some(graph),
            _ => return false,
        }
        if let Some(entry) = inner.graphs.get_mut(&graph) {
            entry.elements.insert(element);
        }
        true
    }

    fn remove_from_graph(&self, graph: GraphHandle, element: ElementHandle) -> bool {
        let mut inner = self.inner.lock();
        let target = format!("{}-{}", inner.graph_name(graph), inner.element_name(element));
        if inner.record(Operation::RemoveFromGraph, target) {
            return false;
        }
        let removed = inner
            .graphs
            .get_mut(&graph)
            .is_some_and(|g| g.elements.remove(&element));
        if removed {
            inner.free_element(element);
        }
        removed
    }

    fn link_elements(&self, src: ElementHandle, dst: ElementHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let (src_name, dst_name) = (inner.element_name(src), inner.element_name(dst));
        if inner.record(Operation::LinkElements, format!("{src_name}->{dst_name}")) {
            return Err(EngineError::Link {
                src: src_name,
                dst: dst_name,
            });
        }

        let src_pad = inner.elements.get(&src).and_then(|e| e.pads.get("src").copied());
        let dst_pad = inner.elements.get(&dst).and_then(|e| e.pads.get("sink").copied());
        match (src_pad, dst_pad) {
            (Some(s), Some(d)) => inner.link(s, d),
            _ => Err(EngineError::Link {
                src: src_name,
                dst: dst_name,
            }),
        }
    }

    fn request_pad(&self, element: ElementHandle, template: &str) -> Result<PadHandle> {
        let mut inner = self.inner.lock();
        let element_name = inner.element_name(element);
        let request_error = || EngineError::PadRequest {
            element: element_name.clone(),
            template: template.to_string(),
        };
        if inner.record(Operation::RequestPad, format!("{element_name}.{template}")) {
            return Err(request_error());
        }

        let Some(entry) = inner.elements.get_mut(&element) else {
            return Err(EngineError::UnknownHandle(element.to_string()));
        };
        let (prefix, direction) = match entry.kind {
            ElementKind::Tee { .. } => ("src_", Direction::Src),
            ElementKind::MultiQueue => ("sink_", Direction::Sink),
            _ => return Err(request_error()),
        };
        let Some(index) = template.strip_prefix(prefix) else {
            return Err(request_error());
        };
        let index = if index == "%u" {
            entry.next_request_index
        } else {
            index.parse::<u32>().map_err(|_| request_error())?
        };
        let name = format!("{prefix}{index}");
        if entry.pads.contains_key(&name) {
            return Err(request_error());
        }
        entry.next_request_index = entry.next_request_index.max(index + 1);
        let is_multiqueue = matches!(entry.kind, ElementKind::MultiQueue);

        let pad = inner.add_pad(element, &name, direction, true);
        if is_multiqueue {
            inner.add_pad(element, &format!("src_{index}"), Direction::Src, false);
        }
        inner.pads_requested += 1;
        Ok(pad)
    }

    fn static_pad(&self, element: ElementHandle, name: &str) -> Option<PadHandle> {
        self.inner
            .lock()
            .elements
            .get(&element)
            .and_then(|e| e.pads.get(name).copied())
    }

    fn release_pad(&self, element: ElementHandle, pad: PadHandle) {
        let mut inner = self.inner.lock();
        let target = inner.pad_name(pad);
        inner.record(Operation::ReleasePad, target);

        let Some(entry) = inner.pads.get(&pad) else {
            warn!(%pad, "Releasing unknown pad");
            return;
        };
        if entry.element != element || !entry.requested {
            warn!(%pad, %element, "Pad is not a request pad of this element");
            return;
        }

        let paired = entry
            .name
            .strip_prefix("sink_")
            .map(|index| format!("src_{index}"));
        let paired = paired.and_then(|name| {
            inner
                .elements
                .get(&element)
                .filter(|e| matches!(e.kind, ElementKind::MultiQueue))
                .and_then(|e| e.pads.get(&name).copied())
        });

        inner.drop_pad(pad);
        if let Some(paired) = paired {
            inner.drop_pad(paired);
        }
        inner.pads_released += 1;
    }

    fn link_pads(&self, src: PadHandle, dst: PadHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let (src_name, dst_name) = (inner.pad_name(src), inner.pad_name(dst));
        if inner.record(Operation::LinkPads, format!("{src_name}->{dst_name}")) {
            return Err(EngineError::Link {
                src: src_name,
                dst: dst_name,
            });
        }
        inner.link(src, dst)
    }

    fn unlink_pads(&self, src: PadHandle, dst: PadHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let (src_name, dst_name) = (inner.pad_name(src), inner.pad_name(dst));
        let unlink_error = EngineError::Unlink {
            src: src_name.clone(),
            dst: dst_name.clone(),
        };
        if inner.record(Operation::UnlinkPads, format!("{src_name}->{dst_name}")) {
            return Err(unlink_error);
        }

        if inner.pads.get(&src).and_then(|p| p.peer) != Some(dst) {
            return Err(unlink_error);
        }
        if let Some(s) = inner.pads.get_mut(&src) {
            s.peer = None;
        }
        if let Some(d) = inner.pads.get_mut(&dst) {
            d.peer = None;
        }
        Ok(())
    }

    fn set_graph_state(&self, graph: GraphHandle, state: GraphState) -> Result<()> {
        let mut inner = self.inner.lock();
        let graph_name = inner.graph_name(graph);
        if inner.record(Operation::SetGraphState, format!("{graph_name}:{state}")) {
            return Err(EngineError::StateChange {
                target: graph_name,
                state,
            });
        }

        let Some(entry) = inner.graphs.get_mut(&graph) else {
            return Err(EngineError::UnknownHandle(graph.to_string()));
        };
        entry.state = state;
        let members: Vec<ElementHandle> = entry.elements.iter().copied().collect();
        let previous_generator = if state == GraphState::Playing {
            None
        } else {
            entry.generator.take()
        };
        let needs_generator = state == GraphState::Playing && entry.generator.is_none();

        if let Some(generator) = previous_generator {
            generator.abort();
        }

        let mut has_source = false;
        for element in members {
            if let Some(e) = inner.elements.get_mut(&element) {
                e.state = state;
                has_source |= matches!(e.kind, ElementKind::UriDecodeBin { .. });
            }
        }

        if needs_generator && has_source {
            if let Some(framerate) = self.config.test_framerate {
                let generator = self.spawn_generator(graph, framerate);
                if let Some(entry) = inner.graphs.get_mut(&graph) {
                    entry.generator = generator;
                }
            }
        }

        debug!(graph = %graph_name, %state, "Graph state changed");
        Ok(())
    }

    fn set_element_state(&self, element: ElementHandle, state: GraphState) -> Result<()> {
        let mut inner = self.inner.lock();
        let element_name = inner.element_name(element);
        if inner.record(Operation::SetElementState, format!("{element_name}:{state}")) {
            return Err(EngineError::StateChange {
                target: element_name,
                state,
            });
        }

        match inner.elements.get_mut(&element) {
            Some(entry) => {
                entry.state = state;
                Ok(())
            }
            None => Err(EngineError::UnknownHandle(element.to_string())),
        }
    }

    fn poll_bus(&self, graph: GraphHandle, filter: BusFilter) -> Option<BusEvent> {
        let mut inner = self.inner.lock();
        let bus = &mut inner.graphs.get_mut(&graph)?.bus;
        while let Some(event) = bus.pop_front() {
            if filter.accepts(&event) {
                return Some(event);
            }
        }
        None
    }

    async fn pull_sample(&self, sink: ElementHandle) -> Result<Sample> {
        let rx = {
            let inner = self.inner.lock();
            inner
                .elements
                .get(&sink)
                .and_then(|e| e.sink.as_ref())
                .map(|queue| Arc::clone(&queue.rx))
                .ok_or_else(|| EngineError::UnknownHandle(sink.to_string()))?
        };

        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(EngineError::EndOfStream)
    }
}
