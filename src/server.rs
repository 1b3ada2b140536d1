// ABOUTME: HTTP server exposing the pairing QR code and session health
// ABOUTME: GET / serves the current QR PNG (404 until one exists), GET /health reports state

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use krypton_core::{QrPayload, SessionManager, SessionState};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub const QR_NOT_AVAILABLE: &str = "QR code not yet available";

#[derive(Clone)]
struct ServerState {
    session: SessionManager,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub state: SessionState,
    pub connection_id: u64,
    pub attempts: u32,
    pub last_disconnect: Option<String>,
    pub restart_pending: bool,
    pub qr_available: bool,
    pub commands: usize,
}

/// Build the router. Reads never wait on the reconnect cycle.
pub fn router(session: SessionManager) -> Router {
    Router::new()
        .route("/", get(qr_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ServerState { session })
}

/// Bind and serve until the token is cancelled
pub async fn serve(
    host: &str,
    port: u16,
    session: SessionManager,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "Server started");

    axum::serve(listener, router(session))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;
    Ok(())
}

async fn qr_handler(State(state): State<ServerState>) -> Response {
    match state.session.qr().current().await {
        Some(payload) => (
            [
                (header::CONTENT_TYPE, QrPayload::CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-store"),
            ],
            payload.png.clone(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, QR_NOT_AVAILABLE).into_response(),
    }
}

async fn health_handler(State(state): State<ServerState>) -> Json<HealthResponse> {
    let snapshot = state.session.snapshot();
    Json(HealthResponse {
        state: snapshot.state,
        connection_id: snapshot.connection_id,
        attempts: snapshot.attempts,
        last_disconnect: snapshot.last_disconnect.map(|r| r.to_string()),
        restart_pending: snapshot.restart_pending,
        qr_available: state.session.qr().current().await.is_some(),
        commands: state.session.registry().len(),
    })
}
