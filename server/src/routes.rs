//! Router assembly and the `POST /api/whistle` handler.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, FromRef, State},
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    api::{WhistleRequest, WhistleResponse},
    backend::Backend,
    error::ApiError,
    health, realtime,
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub backend: Arc<Backend>,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/listen", get(realtime::sse::listen))
        .route("/api/whistle", post(whistle))
        .route("/healthz", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Authorize and publish a batch of envelopes. Authorization and push
/// failures never fail the request; they turn into a `false` at the
/// message's position in the response list.
pub async fn whistle(
    State(backend): State<Arc<Backend>>,
    payload: Result<Json<WhistleRequest>, JsonRejection>,
) -> Result<Json<WhistleResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.to_string()))?;

    let mut published = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        if !backend.can_whistle(message).await? {
            warn!(
                whistler = %message.whistler,
                channel = %message.channel,
                "client unauthorized whistle attempt"
            );
            published.push(false);
            continue;
        }
        info!(
            whistler = %message.whistler,
            channel = %message.channel,
            "client is whistling"
        );
        match backend.push(message).await {
            Ok(_) => published.push(true),
            Err(error) => {
                error!(%error, channel = %message.channel, "failed to append envelope");
                published.push(false);
            }
        }
    }
    Ok(Json(WhistleResponse { published }))
}
