//! Introspection serves the metrics registry and a liveness check over HTTP.

use std::net::SocketAddr;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, Registry, TEXT_FORMAT, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::prelude::*;

/// App returns the introspection routes backed by `registry`.
pub fn app(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(gather))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serve runs the introspection server on `addr` until `cancel` fires.
pub async fn serve(addr: SocketAddr, registry: Registry, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "started introspection server");
    axum::serve(listener, app(registry))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!(%addr, "introspection server stopped");
    Ok(())
}

async fn gather(State(registry): State<Registry>) -> Response {
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&registry.gather(), &mut buf) {
        error!("unable to encode metrics: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], buf).into_response()
}

async fn healthz() -> &'static str {
    "ok"
}
