mod server;

use anyhow::Result;
use camstream_core::{logging, Config, EngineKind, MediaConfig};
use camstream_media::{MediaEngine, MemoryEngine, MemoryEngineConfig};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use server::CamstreamServer;

/// WebRTC fan-out server for camera streams
#[derive(Debug, Parser)]
#[command(name = "camstream", version, about)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(
        short,
        long,
        env = "CAMSTREAM_CONFIG_PATH",
        default_value = "./camstream.toml"
    )]
    config: String,
}

fn create_engine(config: &MediaConfig) -> Result<Arc<dyn MediaEngine>> {
    match config.engine {
        EngineKind::Memory => {
            let engine = MemoryEngine::with_config(MemoryEngineConfig {
                test_framerate: config.synthetic_framerate(),
                sink_queue_capacity: config.sink_queue_capacity,
            });
            Ok(Arc::new(engine))
        }
        #[cfg(feature = "gstreamer")]
        EngineKind::Gstreamer => {
            let engine = camstream_media::GstEngine::new()
                .map_err(|e| anyhow::anyhow!("Failed to initialize GStreamer: {e}"))?;
            Ok(Arc::new(engine))
        }
        #[cfg(not(feature = "gstreamer"))]
        EngineKind::Gstreamer => Err(anyhow::anyhow!(
            "media.engine = \"gstreamer\" requires building with the gstreamer feature"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let config = match Config::load_validated(Some(&cli.config)) {
        Ok(config) => config,
        Err(camstream_core::Error::InvalidConfig(errors)) => {
            for e in &errors {
                eprintln!("Config validation error: {e}");
            }
            return Err(anyhow::anyhow!(
                "Configuration validation failed with {} error(s)",
                errors.len()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("camstream starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Media engine
    let engine = create_engine(&config.media)?;
    info!(engine = ?config.media.engine, "Media engine ready");

    // 4. Streams, peers and HTTP surface
    let server = CamstreamServer::new(&config, engine)?;
    for camera in &config.cameras {
        if let Err(e) = server.register_camera(camera) {
            warn!(camera_id = %camera.id, error = %e, "Skipping camera");
        }
    }

    server.run(&config).await?;

    info!("camstream stopped");
    Ok(())
}
