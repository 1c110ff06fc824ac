use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::backend::Backend;

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    store: bool,
}

/// Liveness probe - the process is up and serving.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe - the stream store answers a PING.
pub async fn readiness(
    State(backend): State<Arc<Backend>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let store = backend.ping().await;
    let status = if store {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready: store, store }))
}
