//! Router-level tests against the in-memory media engine

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use camstream_api::{create_router, AppState, CameraServiceClient};
use camstream_core::{CameraConfig, CorsConfig, EncoderConfig, FanoutConfig};
use camstream_fanout::{StreamInfo, StreamManager};
use camstream_media::MemoryEngine;
use camstream_signaling::RtcPeerFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn state(camera_service: Option<CameraServiceClient>) -> (AppState, Arc<MemoryEngine>) {
    let engine = Arc::new(MemoryEngine::new());
    let manager = StreamManager::new(
        engine.clone(),
        EncoderConfig::default(),
        FanoutConfig::default(),
    );
    let state = AppState {
        manager: Arc::new(manager),
        peers: Arc::new(RtcPeerFactory::new(&[]).unwrap()),
        camera_service: camera_service.map(Arc::new),
        max_message_size: 64 * 1024,
        shutdown: CancellationToken::new(),
    };
    (state, engine)
}

fn camera(id: &str, name: &str) -> CameraConfig {
    CameraConfig {
        id: id.to_string(),
        name: name.to_string(),
        ..Default::default()
    }
}

fn router(state: AppState) -> Router {
    create_router(state, &CorsConfig::default())
}

async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_health() {
    let (state, _) = state(None);
    let (status, body) = get(router(state), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_list_streams() {
    let (state, _) = state(None);
    state.manager.register(&camera("b", "Back")).unwrap();
    state.manager.register(&camera("a", "Front")).unwrap();

    let (status, body) = get(router(state), "/streams").await;
    assert_eq!(status, StatusCode::OK);

    let streams: Vec<StreamInfo> = serde_json::from_slice(&body).unwrap();
    let ids: Vec<&str> = streams.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(streams[0].name, "Front");
    assert_eq!(streams[0].branch_count, 0);
}

#[tokio::test]
async fn test_unknown_stream_is_404() {
    let (state, _) = state(None);
    let (status, body) = get(router(state), "/streams/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn test_plain_request_does_not_attach() {
    let (state, _) = state(None);
    let stream = state.manager.register(&camera("cam", "Cam")).unwrap();

    let (status, _) = get(router(state), "/streams/cam").await;
    assert!(status.is_client_error());
    assert_ne!(status, StatusCode::NOT_FOUND);
    assert_eq!(stream.branch_count(), 0);
}

#[tokio::test]
async fn test_first_access_creates_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cameras/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "Loading dock",
            "hostname": "10.0.0.7",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = CameraServiceClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
    let (state, engine) = state(Some(client));
    let manager = Arc::clone(&state.manager);
    let router = router(state);

    get(router.clone(), "/streams/7").await;
    // already registered; the camera service is not asked again
    get(router, "/streams/7").await;

    let stream = manager.get("7").unwrap();
    assert_eq!(stream.name(), "Loading dock");
    assert_eq!(engine.graph_count(), 1);
}

#[tokio::test]
async fn test_unknown_camera_is_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = CameraServiceClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
    let (state, engine) = state(Some(client));
    let manager = Arc::clone(&state.manager);

    let (status, _) = get(router(state), "/streams/9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(manager.is_empty());
    assert_eq!(engine.graph_count(), 0);
}

#[tokio::test]
async fn test_camera_service_failure_is_500() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = CameraServiceClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
    let (state, _) = state(Some(client));

    let (status, _) = get(router(state), "/streams/9").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_cors_allowed_origin() {
    let (state, _) = state(None);
    let cors = CorsConfig {
        allow_all_origins: false,
        allowed_origins: vec!["http://viewer.local".to_string()],
    };
    let router = create_router(state, &cors);

    let response = router
        .oneshot(
            Request::get("/health")
                .header(header::ORIGIN, "http://viewer.local")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://viewer.local"
    );
}
