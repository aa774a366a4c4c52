// HTTP surface: stream listing, viewer WebSocket endpoint and health probe

pub mod error;
pub mod health;
pub mod stream;

use axum::http::{HeaderValue, Method};
use axum::Router;
use camstream_core::CorsConfig;
use camstream_fanout::StreamManager;
use camstream_signaling::RtcPeerFactory;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::camera_service::CameraServiceClient;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub peers: Arc<RtcPeerFactory>,
    /// Resolves unregistered stream ids; `None` disables first-access creation
    pub camera_service: Option<Arc<CameraServiceClient>>,
    pub max_message_size: usize,
    /// Cancelled when the server shuts down; ends every viewer session
    pub shutdown: CancellationToken,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, cors: &CorsConfig) -> Router {
    Router::new()
        .merge(stream::create_stream_router())
        .merge(health::create_health_router())
        .layer(build_cors(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    if config.allow_all_origins {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
