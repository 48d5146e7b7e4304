//! Relay admin HTTP surface: health, Prometheus metrics and the live
//! mapping document.

use crate::middleware::require_bearer;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use lanbridge_common::{MappingStore, TunnelError};
use lanbridge_core::ClientRegistry;
use lanbridge_observability::{gather_metrics, reset_metrics};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct AdminState {
    pub mappings: Arc<MappingStore>,
    pub registry: Arc<ClientRegistry>,
    pub token: Option<String>,
}

#[derive(Serialize)]
struct ClientStatus {
    client_key: String,
    ports: Vec<u16>,
    users: usize,
}

pub fn router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/metrics", get(metrics))
        .route("/metrics/reset", post(reset))
        .route("/config", get(get_config).put(put_config))
        .route("/clients", get(clients))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health/ready", get(|| async { "OK" }))
        .merge(protected)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AdminState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin API to {addr}"))?;
    info!("Admin API listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("admin API server failed")
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

async fn reset() -> StatusCode {
    reset_metrics();
    info!("Metrics reset via admin API");
    StatusCode::NO_CONTENT
}

async fn get_config(State(state): State<AdminState>) -> Response {
    json_document(state.mappings.current().to_json_pretty())
}

async fn put_config(State(state): State<AdminState>, body: String) -> Response {
    let mappings = state.mappings.clone();
    match tokio::task::spawn_blocking(move || mappings.update_json(&body)).await {
        Ok(Ok(table)) => json_document(table.to_json_pretty()),
        Ok(Err(e @ (TunnelError::Config(_) | TunnelError::Serialization(_)))) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn clients(State(state): State<AdminState>) -> Json<Vec<ClientStatus>> {
    let mut online: Vec<_> = state
        .registry
        .client_keys()
        .into_iter()
        .map(|client_key| ClientStatus {
            ports: state.registry.ports_of(&client_key),
            users: state.registry.user_count(&client_key),
            client_key,
        })
        .collect();
    online.sort_by(|a, b| a.client_key.cmp(&b.client_key));
    Json(online)
}

fn json_document(json: lanbridge_common::Result<String>) -> Response {
    match json {
        Ok(json) => ([(header::CONTENT_TYPE, "application/json")], json).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
