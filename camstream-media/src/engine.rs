//! The Media Engine contract
//!
//! Everything the fan-out layer needs from a media pipeline library:
//! building a graph, requesting and releasing dynamic pads, linking, state
//! changes, bus polling and pulling encoded samples out of a sink. Objects are
//! referred to by small copyable handles; every acquisition has a matching
//! explicit release so nothing depends on finalizer timing.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::error::Result;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle!(
    /// A top-level media graph (pipeline)
    GraphHandle,
    "graph"
);
handle!(
    /// A processing element inside (or about to be added to) a graph
    ElementHandle,
    "element"
);
handle!(
    /// A connection point on an element
    PadHandle,
    "pad"
);

/// The element types the fan-out graph is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    /// Source that demuxes and decodes whatever lives at `uri` into raw video
    UriDecodeBin { uri: String },
    Queue,
    Vp8Encoder { deadline: i64, cpu_used: i32 },
    /// Fan-out junction; `allow_not_linked` keeps it flowing with zero outputs
    Tee { allow_not_linked: bool },
    /// Per-branch buffering with independent backpressure
    MultiQueue,
    /// Terminal element surfacing samples to the application
    AppSink { sync: bool },
}

impl ElementKind {
    /// Factory name of the element in pipeline-library terms
    #[must_use]
    pub const fn factory_name(&self) -> &'static str {
        match self {
            Self::UriDecodeBin { .. } => "uridecodebin",
            Self::Queue => "queue",
            Self::Vp8Encoder { .. } => "vp8enc",
            Self::Tee { .. } => "tee",
            Self::MultiQueue => "multiqueue",
            Self::AppSink { .. } => "appsink",
        }
    }
}

/// Run state of a graph or a single element
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphState {
    Idle,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Paused => "paused",
            Self::Playing => "playing",
        };
        f.write_str(name)
    }
}

/// Notification popped from a graph's event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Error {
        source: String,
        message: String,
        debug: Option<String>,
    },
    EndOfStream,
    /// Pipeline latency changed and should be recalculated
    Latency,
}

impl BusEvent {
    /// Whether the graph can no longer produce data after this event
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::EndOfStream)
    }
}

/// Which bus events a poll is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFilter {
    pub errors: bool,
    pub end_of_stream: bool,
    pub latency: bool,
}

impl BusFilter {
    pub const FATAL: Self = Self {
        errors: true,
        end_of_stream: true,
        latency: false,
    };

    pub const ALL: Self = Self {
        errors: true,
        end_of_stream: true,
        latency: true,
    };

    #[must_use]
    pub const fn accepts(&self, event: &BusEvent) -> bool {
        match event {
            BusEvent::Error { .. } => self.errors,
            BusEvent::EndOfStream => self.end_of_stream,
            BusEvent::Latency => self.latency,
        }
    }
}

/// One encoded unit pulled from a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub data: Bytes,
    pub duration: Duration,
}

/// The pipeline library as seen by the fan-out layer.
///
/// Mutating calls are synchronous; callers serialize topology changes
/// themselves. Only sample pulls suspend.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    fn create_graph(&self, name: &str) -> Result<GraphHandle>;

    /// Set the graph idle and free it together with every element inside
    fn destroy_graph(&self, graph: GraphHandle);

    fn create_element(&self, kind: &ElementKind, name: &str) -> Result<ElementHandle>;

    /// Free an element that is not part of any graph
    fn dispose_element(&self, element: ElementHandle);

    fn add_to_graph(&self, graph: GraphHandle, element: ElementHandle) -> bool;

    /// Remove an element from its graph and free it
    fn remove_from_graph(&self, graph: GraphHandle, element: ElementHandle) -> bool;

    /// Link the default output of `src` to the default input of `dst`.
    ///
    /// Sources whose outputs appear at runtime are linked once the pad shows up.
    fn link_elements(&self, src: ElementHandle, dst: ElementHandle) -> Result<()>;

    /// Request a new pad from a request template (`src_%u`) or by explicit
    /// name (`sink_3`)
    fn request_pad(&self, element: ElementHandle, template: &str) -> Result<PadHandle>;

    fn static_pad(&self, element: ElementHandle, name: &str) -> Option<PadHandle>;

    fn release_pad(&self, element: ElementHandle, pad: PadHandle);

    fn link_pads(&self, src: PadHandle, dst: PadHandle) -> Result<()>;

    fn unlink_pads(&self, src: PadHandle, dst: PadHandle) -> Result<()>;

    fn set_graph_state(&self, graph: GraphHandle, state: GraphState) -> Result<()>;

    fn set_element_state(&self, element: ElementHandle, state: GraphState) -> Result<()>;

    /// Pop the next pending bus event matching `filter`, if any.
    ///
    /// Non-matching events ahead of it are discarded.
    fn poll_bus(&self, graph: GraphHandle, filter: BusFilter) -> Option<BusEvent>;

    /// Wait for the next sample from an app sink.
    ///
    /// Must be cancel-safe: dropping the future loses no sample.
    async fn pull_sample(&self, sink: ElementHandle) -> Result<Sample>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_events() {
        assert!(BusEvent::EndOfStream.is_fatal());
        assert!(BusEvent::Error {
            source: "src".into(),
            message: "boom".into(),
            debug: None
        }
        .is_fatal());
        assert!(!BusEvent::Latency.is_fatal());
    }

    #[test]
    fn test_filter_accepts() {
        assert!(!BusFilter::FATAL.accepts(&BusEvent::Latency));
        assert!(BusFilter::ALL.accepts(&BusEvent::Latency));
        assert!(BusFilter::FATAL.accepts(&BusEvent::EndOfStream));
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(PadHandle::new(7).to_string(), "pad#7");
        assert_eq!(ElementKind::MultiQueue.factory_name(), "multiqueue");
    }
}
