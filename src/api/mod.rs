//! HTTP API for a mesh.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/chat` - Run a top-level chat and return its response
//! - `GET /api/events` - Stream execution events via SSE (`?trace_id=` filters)
//! - `GET /api/nodes` - List registered nodes

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::{ChatPayload, Mesh};
use crate::envelope::Response;
use crate::events::{BroadcastSink, Event};
use crate::registry::NodeInfo;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub mesh: Mesh,
    /// Sink the mesh was built with; SSE clients subscribe to it
    pub events: BroadcastSink,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub nodes: usize,
    pub master: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Only forward events of this trace
    pub trace_id: Option<String>,
}

/// Build the router over `mesh`.
pub fn router(mesh: Mesh, events: BroadcastSink) -> Router {
    let state = Arc::new(AppState { mesh, events });

    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/events", get(stream_events))
        .route("/api/nodes", get(list_nodes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until Ctrl+C / SIGTERM, then release mesh resources.
pub async fn serve(mesh: Mesh, events: BroadcastSink) -> anyhow::Result<()> {
    let addr = format!("{}:{}", mesh.config().host, mesh.config().port);
    let app = router(mesh.clone(), events);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    mesh.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let registry = state.mesh.registry();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        nodes: registry.len(),
        master: registry.master().map(str::to_string),
    })
}

/// Run a chat. Dropping the request (client disconnect) cancels the run.
async fn chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatPayload>,
) -> Result<Json<Response>, (StatusCode, String)> {
    let registry = state.mesh.registry();
    match payload.node.as_deref() {
        Some(node) if !registry.contains(node) => {
            return Err((StatusCode::NOT_FOUND, format!("Unknown node: {}", node)));
        }
        None if registry.master().is_none() => {
            return Err((
                StatusCode::BAD_REQUEST,
                "No target node given and no master node registered".to_string(),
            ));
        }
        _ => {}
    }

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let response = state.mesh.chat_with_cancel(payload, cancel).await;
    Ok(Json(response))
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeInfo>> {
    Json(state.mesh.registry().describe())
}

fn to_sse(event: &Event) -> Option<SseEvent> {
    match SseEvent::default().event(event.event_name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!("Failed to encode event: {}", e);
            None
        }
    }
}

/// Stream execution events via SSE.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.events.subscribe();
    let trace_filter = query.trace_id;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if trace_filter.as_deref().is_some_and(|t| t != event.trace_id()) {
                        continue;
                    }
                    if let Some(sse) = to_sse(&event) {
                        yield Ok(sse);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "SSE client lagged");
                    yield Ok(SseEvent::default()
                        .event("error")
                        .data(format!("event stream lagged; {} events were dropped", skipped)));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
