//! camstream stream fan-out
//!
//! One media graph per camera, decoded and encoded once, shared by every
//! viewer watching that camera.
//!
//! ## Architecture
//!
//! - **`Stream`**: the shared chain plus the per-viewer branch table
//! - **`Attachment`**: a viewer's branch; detach it when the viewer leaves
//! - **`StreamManager`**: registry of streams keyed by camera id
//!
//! ## Usage
//!
//! ```rust,ignore
//! use camstream_fanout::StreamManager;
//!
//! let manager = StreamManager::new(engine, config.encoder, config.fanout);
//! let stream = manager.register(&camera)?;
//! let attachment = stream.attach().await?;
//! peer.add_track(attachment.track()).await?;
//! // ...
//! attachment.detach().await?;
//! ```

mod branch;
mod bus;
mod error;
mod manager;
mod stream;
mod types;

pub use branch::{SampleWriter, WriteError};
pub use bus::BusHandler;
pub use error::{Result, StreamError};
pub use manager::StreamManager;
pub use stream::{Attachment, Stream};
pub use types::{BranchId, StreamId, StreamInfo};
