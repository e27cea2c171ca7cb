//! HTTP server for tierstream
//!
//! Thin request handlers over the stream orchestrator, the observer WebSocket,
//! and static serving of the HLS output root.

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::TierId;
use crate::hub::{BroadcastHub, ServerMessage};
use crate::metrics::{timestamp_ms, MetricsSnapshot};
use crate::orchestrator::{OrchestratorError, PerformanceReport, StreamOrchestrator};

pub type AppState = Arc<StreamOrchestrator>;

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Client-facing request failure, always answered with 400
#[derive(Debug)]
pub enum ApiError {
    Orchestrator(OrchestratorError),
    BadRequest(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError::Orchestrator(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match self {
            ApiError::Orchestrator(e) => e.to_string(),
            ApiError::BadRequest(message) => message,
        };
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": message })),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamResponse {
    success: bool,
    tier_id: TierId,
    manifest_url: String,
    /// Same as `manifest_url`; older players read this name
    playlist_url: String,
}

/// Body of POST /api/latency-boundary
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoundaryRequest {
    #[serde(alias = "boundary")]
    boundary_ms: f64,
    #[serde(default)]
    tier_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Informational tag such as "player" or "dashboard"
    pub role: Option<String>,
}

/// Handler for GET /api/stream/:quality
async fn request_stream(
    State(orchestrator): State<AppState>,
    Path(quality): Path<String>,
) -> Result<Json<StreamResponse>, ApiError> {
    let request = orchestrator.request_tier(&quality).await?;
    Ok(Json(StreamResponse {
        success: true,
        tier_id: request.tier_id,
        playlist_url: request.manifest_url.clone(),
        manifest_url: request.manifest_url,
    }))
}

/// Handler for GET /api/metrics
async fn get_metrics(State(orchestrator): State<AppState>) -> Json<MetricsSnapshot> {
    Json(orchestrator.get_snapshot().await)
}

/// Handler for GET /api/performance
async fn get_performance(State(orchestrator): State<AppState>) -> Json<PerformanceReport> {
    Json(orchestrator.performance_report().await)
}

/// Handler for POST /api/latency-boundary
async fn set_latency_boundary(
    State(orchestrator): State<AppState>,
    body: Result<Json<BoundaryRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = body?;
    let update = orchestrator
        .set_latency_boundary(body.boundary_ms, body.tier_id.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "boundaryMs": update.boundary_ms,
        "tierId": update.tier_id,
        "scope": update.tier_id.map_or("all", |t| t.as_str()),
    })))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "timestamp": timestamp_ms() }))
}

/// Handler for GET /ws
async fn ws_handler(
    State(orchestrator): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let role = query.role.unwrap_or_else(|| "observer".to_string());
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, orchestrator, role))
}

async fn handle_socket(socket: WebSocket, orchestrator: AppState, role: String) {
    let hub = orchestrator.hub().clone();
    let (tx, mut rx) = mpsc::channel::<String>(orchestrator.observer_buffer());
    let id = hub.connect(&role, tx).await;

    // Best-effort initial state so the client is not blank until the next tick
    let snapshot = orchestrator.get_snapshot().await;
    hub.send_to(
        id,
        &ServerMessage::Performance {
            per_stream: snapshot.per_stream,
            timestamp: snapshot.timestamp,
        },
    )
    .await;

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    if let Some(reply) = BroadcastHub::handle_client_text(&text) {
                        recv_hub.send_to(id, &reply).await;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Either side ending closes the connection
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    hub.disconnect(id).await;
    debug!(observer = %id, %role, "websocket closed");
}

/// Creates the axum Router with every endpoint
///
/// With `serve_segments` the output root is mounted under `/hls`, which is
/// where manifest URLs point.
pub fn create_router(orchestrator: AppState, serve_segments: bool) -> Router {
    let output_root = orchestrator.catalog().output_root().to_path_buf();
    let mut router = Router::new()
        .route("/api/stream/:quality", get(request_stream))
        .route("/api/metrics", get(get_metrics))
        .route("/api/performance", get(get_performance))
        .route("/api/latency-boundary", post(set_latency_boundary))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(orchestrator);

    if serve_segments {
        router = router.nest_service("/hls", ServeDir::new(output_root));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves, then drain open connections
pub async fn run_server<F>(
    orchestrator: AppState,
    bind_addr: &str,
    serve_segments: bool,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(orchestrator, serve_segments);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}
