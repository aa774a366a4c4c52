use anyhow::Result;
use camstream_api::{create_router, AppState, CameraServiceClient};
use camstream_core::{CameraConfig, Config};
use camstream_fanout::{Stream, StreamManager};
use camstream_media::MediaEngine;
use camstream_signaling::RtcPeerFactory;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wires the stream manager, peer factory and HTTP router together
pub struct CamstreamServer {
    manager: Arc<StreamManager>,
    state: AppState,
}

impl CamstreamServer {
    pub fn new(config: &Config, engine: Arc<dyn MediaEngine>) -> Result<Self> {
        let manager = Arc::new(StreamManager::new(
            engine,
            config.encoder.clone(),
            config.fanout.clone(),
        ));
        manager.on_bus_event(|stream_id, event| {
            if event.is_fatal() {
                error!(stream_id = %stream_id, event = ?event, "Stream pipeline failed");
            }
        });

        let peers = RtcPeerFactory::new(&config.webrtc.stun_servers)
            .map_err(|e| anyhow::anyhow!("Failed to create WebRTC API: {e}"))?;

        let camera_service = CameraServiceClient::from_config(&config.camera_service)?;
        match &config.camera_service.url {
            Some(url) => info!("Camera service: {}", url),
            None => info!("No camera service configured; serving static cameras only"),
        }

        let state = AppState {
            manager: Arc::clone(&manager),
            peers: Arc::new(peers),
            camera_service: camera_service.map(Arc::new),
            max_message_size: config.server.max_message_size,
            shutdown: CancellationToken::new(),
        };

        Ok(Self { manager, state })
    }

    /// Register a camera from the static list
    pub fn register_camera(&self, camera: &CameraConfig) -> Result<Arc<Stream>> {
        let stream = self.manager.register(camera)?;
        info!(stream_id = %stream.id(), name = %stream.name(), "Camera registered");
        Ok(stream)
    }

    /// Serve HTTP until a shutdown signal, then end every session and stream
    pub async fn run(self, config: &Config) -> Result<()> {
        let http_address = config.http_address();
        let http_addr: std::net::SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let shutdown = self.state.shutdown.clone();
        let router = create_router(self.state, &config.server.cors);

        let graceful = {
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                info!("Shutdown signal received, starting graceful shutdown...");
                shutdown.cancel();
            }
        };

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("HTTP server error: {}", e);
        }
        // a server error also ends open sessions
        shutdown.cancel();

        self.manager.shutdown().await;
        info!("HTTP server shut down gracefully");
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
