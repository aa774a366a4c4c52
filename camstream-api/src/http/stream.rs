//! Stream listing and the viewer WebSocket endpoint
//!
//! `GET /streams/{id}` attaches a branch before upgrading, so a viewer asking
//! for an unknown or broken stream gets a plain HTTP error. Once upgraded, the
//! socket carries the signaling session for one peer connection.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use camstream_fanout::{Attachment, Stream, StreamError, StreamInfo};
use camstream_signaling::{
    shared_writer, PeerConnection, SharedWriter, SignalingSession, TransportReader,
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::http::{AppError, AppResult, AppState};
use crate::ws::{WsReader, WsWriter};

pub fn create_stream_router() -> Router<AppState> {
    Router::new()
        .route("/streams", get(list_streams))
        .route("/streams/{id}", get(stream_handler))
}

pub async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamInfo>> {
    Json(state.manager.list())
}

/// Upgrade to a signaling WebSocket for stream `id`
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let stream = resolve_stream(&state, &id).await?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    let attachment = stream.attach().await?;

    info!(
        stream_id = %attachment.stream().id(),
        branch_id = %attachment.branch_id(),
        "Viewer attached"
    );

    let max_message_size = state.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| serve_viewer(socket, state, attachment))
        .into_response())
}

/// Registered stream for `id`, created through the camera service on first
/// access when one is configured
async fn resolve_stream(state: &AppState, id: &str) -> AppResult<Arc<Stream>> {
    if let Some(stream) = state.manager.get(id) {
        return Ok(stream);
    }

    let Some(service) = state.camera_service.clone() else {
        return Err(AppError::not_found(format!("Unknown stream: {id}")));
    };

    let stream = state
        .manager
        .get_or_create(id, |id| async move {
            service
                .lookup(&id)
                .await
                .map_err(|e| StreamError::Lookup(e.to_string()))
        })
        .await?;
    Ok(stream)
}

async fn serve_viewer(socket: WebSocket, state: AppState, attachment: Attachment) {
    let stream_id = attachment.stream().id().clone();
    let branch_id = attachment.branch_id();

    let (sink, source) = socket.split();
    let writer = shared_writer(WsWriter::new(sink));
    let reader = WsReader::new(source);

    let result = run_session(&state, &attachment, Box::new(reader), Arc::clone(&writer)).await;

    let (code, reason) = match &result {
        Ok(()) if state.shutdown.is_cancelled() => (CLOSE_GOING_AWAY, "server shutting down"),
        Ok(()) => (CLOSE_NORMAL, "session ended"),
        Err(_) => (CLOSE_INTERNAL_ERROR, "session failed"),
    };
    if let Err(err) = writer.lock().await.close(code, reason).await {
        debug!(stream_id = %stream_id, branch_id = %branch_id, error = %err, "Socket already closed");
    }

    if let Err(err) = attachment.detach().await {
        warn!(stream_id = %stream_id, branch_id = %branch_id, error = %err, "Detach failed");
    }
    info!(stream_id = %stream_id, branch_id = %branch_id, "Viewer left");
}

/// Create the peer connection, send the branch track and negotiate until the
/// viewer leaves. The peer connection is closed on every path.
async fn run_session(
    state: &AppState,
    attachment: &Attachment,
    reader: Box<dyn TransportReader>,
    writer: SharedWriter,
) -> camstream_signaling::Result<()> {
    let peer = state.peers.create().await?;
    let label = format!("{}/{}", attachment.stream().id(), attachment.branch_id());

    // handlers go in before the track so the first negotiation is not missed
    let session = SignalingSession::new(
        label,
        Arc::clone(&peer) as Arc<dyn PeerConnection>,
        reader,
        writer,
    );

    let handle = session.handle();
    let shutdown = state.shutdown.clone();
    let watcher = tokio::spawn(async move {
        shutdown.cancelled().await;
        handle.cancel();
    });

    let result = match peer.add_track(attachment.track()).await {
        Ok(()) => session.run().await,
        Err(err) => Err(err.into()),
    };
    watcher.abort();

    if let Err(err) = peer.close().await {
        debug!(error = %err, "Peer connection close failed");
    }
    result
}
