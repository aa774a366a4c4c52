//! Media Engine abstraction for camstream
//!
//! The fan-out layer drives media graphs exclusively through the
//! [`MediaEngine`] trait. Two implementations ship here:
//!
//! - [`MemoryEngine`]: in-process, instrumented, used by default and in tests
//! - `GstEngine`: GStreamer pipelines, behind the `gstreamer` feature

pub mod engine;
pub mod error;
pub mod memory;

#[cfg(feature = "gstreamer")]
pub mod gst;

pub use engine::{
    BusEvent, BusFilter, ElementHandle, ElementKind, GraphHandle, GraphState, MediaEngine,
    PadHandle, Sample,
};
pub use error::{EngineError, Result};
pub use memory::{EngineCall, MemoryEngine, MemoryEngineConfig, Operation};

#[cfg(feature = "gstreamer")]
pub use gst::GstEngine;
