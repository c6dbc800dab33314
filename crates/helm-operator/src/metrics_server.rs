//! HTTP endpoint for Prometheus scrapes and health checks
//!
//! - `GET /metrics` renders the process registry in text exposition format
//! - `GET /healthz` always answers `ok` while the process serves requests
//! - `GET /readyz` answers `ok` only while the host is running

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::RunError;
use crate::host::HostState;

#[derive(Clone)]
struct ServerState {
    registry: prometheus::Registry,
    host: watch::Receiver<HostState>,
}

/// Build the metrics and health routes
pub(crate) fn routes(registry: prometheus::Registry, host: watch::Receiver<HostState>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness))
        .with_state(ServerState { registry, host })
}

async fn render_metrics(State(state): State<ServerState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut body) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            e.to_string().into_bytes(),
        ),
    }
}

async fn readiness(State(state): State<ServerState>) -> (StatusCode, &'static str) {
    if *state.host.borrow() == HostState::Running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Bind `addr` and serve until `shutdown` fires
///
/// Binding happens before this returns so that an unusable address fails
/// the run immediately.
pub(crate) async fn serve(
    addr: SocketAddr,
    registry: prometheus::Registry,
    host: watch::Receiver<HostState>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<Result<(), RunError>>, RunError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RunError::MetricsServer {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
    let local = listener.local_addr().unwrap_or(addr);
    info!(addr = %local, "metrics server started");

    let app = routes(registry, host);
    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| RunError::MetricsServer {
                addr: local.to_string(),
                message: e.to_string(),
            })
    }))
}
