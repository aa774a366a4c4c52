use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub encoder: EncoderConfig,
    pub fanout: FanoutConfig,
    pub webrtc: WebRtcConfig,
    pub camera_service: CameraServiceConfig,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for a single signaling frame, in bytes
    pub max_message_size: usize,
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_message_size: 64 * 1024,
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allow_all_origins: bool,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Which Media Engine implementation backs the streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process engine producing synthetic frames
    #[default]
    Memory,
    /// GStreamer pipelines (requires the `gstreamer` feature)
    Gstreamer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub engine: EngineKind,
    /// Frame rate of synthetic sources in the memory engine; 0 disables them
    pub test_framerate: u32,
    /// Per-sink buffered samples before the memory engine starts dropping
    pub sink_queue_capacity: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Memory,
            test_framerate: 30,
            sink_queue_capacity: 64,
        }
    }
}

impl MediaConfig {
    /// Synthetic frame rate, `None` when frame generation is off
    #[must_use]
    pub fn synthetic_framerate(&self) -> Option<u32> {
        (self.test_framerate > 0).then_some(self.test_framerate)
    }
}

/// VP8 encoder timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Encode deadline in microseconds
    pub deadline: i64,
    pub cpu_used: i32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            deadline: 33333,
            cpu_used: 3,
        }
    }
}

/// State the shared graph falls back to once the last viewer detaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    #[default]
    Paused,
    Ready,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub idle_state: IdleState,
    pub bus_poll_interval_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            idle_state: IdleState::Paused,
            bus_poll_interval_ms: 25,
        }
    }
}

impl FanoutConfig {
    #[must_use]
    pub const fn bus_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bus_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Remote directory consulted when a viewer asks for an unregistered camera
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraServiceConfig {
    /// Base URL, e.g. `http://localhost:3001`. Lookups are disabled when unset.
    pub url: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for CameraServiceConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: 5,
        }
    }
}

/// One camera source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub user: String,
    pub password: String,
    /// Full source URI; takes precedence over the RTSP fields when set
    pub uri: Option<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            hostname: "localhost".to_string(),
            port: 554,
            path: String::new(),
            user: String::new(),
            password: String::new(),
            uri: None,
        }
    }
}

impl CameraConfig {
    /// Source URI handed to the decode stage.
    ///
    /// Credentials are embedded only when both user and password are set.
    #[must_use]
    pub fn source_uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }

        let path = if self.path.is_empty() || self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        if !self.user.is_empty() && !self.password.is_empty() {
            format!(
                "rtsp://{}:{}@{}:{}{}",
                self.user, self.password, self.hostname, self.port, path
            )
        } else {
            format!("rtsp://{}:{}{}", self.hostname, self.port, path)
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CAMSTREAM_SERVER__PORT, CAMSTREAM_FANOUT__IDLE_STATE, ...
        builder = builder.add_source(
            Environment::with_prefix("CAMSTREAM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from the given file (if any) and environment, then validate
    pub fn load_validated(config_file: Option<&str>) -> crate::Result<Self> {
        let config = Self::load(config_file)?;
        config.validate().map_err(crate::Error::InvalidConfig)?;
        Ok(config)
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check for misconfigurations, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be non-zero".to_string());
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if self.media.sink_queue_capacity == 0 {
            errors.push("media.sink_queue_capacity must be non-zero".to_string());
        }
        if self.fanout.bus_poll_interval_ms == 0 {
            errors.push("fanout.bus_poll_interval_ms must be non-zero".to_string());
        }

        for server in &self.webrtc.stun_servers {
            if !(server.starts_with("stun:") || server.starts_with("turn:")) {
                errors.push(format!("webrtc.stun_servers entry {server:?} is not a stun:/turn: URL"));
            }
        }

        if let Some(url) = &self.camera_service.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("camera_service.url {url:?} must be an http(s) URL"));
            }
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.is_empty() {
                errors.push(format!("camera {:?} has an empty id", camera.name));
            } else if !seen.insert(camera.id.as_str()) {
                errors.push(format!("duplicate camera id {:?}", camera.id));
            }
            if camera.uri.is_none() && camera.port == 0 {
                errors.push(format!("camera {:?} has port 0", camera.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
