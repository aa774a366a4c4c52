//! Shared foundation for the camstream crates: configuration, the top-level
//! error type and logging setup.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    CameraConfig, CameraServiceConfig, Config, CorsConfig, EncoderConfig, EngineKind, FanoutConfig,
    IdleState, LoggingConfig, MediaConfig, ServerConfig, WebRtcConfig,
};
pub use error::{Error, Result};
