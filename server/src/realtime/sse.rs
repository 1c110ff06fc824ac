//! `GET /api/listen` — the per-listener delivery loop.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    backend::{Backend, Pull},
    client::{HEADER_CHANNELS, HEADER_GUID, HEADER_SIGNATURE},
    error::ApiError,
};

/// Interval between keep-alive ping comments.
const PING_INTERVAL: Duration = Duration::from_secs(5);

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("missing header: {name}")))
}

/// Authorize the subscription, then stream deliveries as SSE events.
///
/// Each envelope is sent as an `event: whistle` frame and acknowledged once
/// the frame has been handed to the connection, so a crash in between
/// re-delivers rather than drops (at-least-once). Peer disconnection drops
/// the response stream, which cancels the loop at its next await point;
/// server shutdown is observed through the cancellation token and answered
/// with a final `event: reset` frame.
pub async fn listen(
    State(backend): State<Arc<Backend>>,
    State(shutdown): State<CancellationToken>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let guid = required_header(&headers, HEADER_GUID)?.to_string();
    let raw_channels = required_header(&headers, HEADER_CHANNELS)?;
    let signature = required_header(&headers, HEADER_SIGNATURE)?.to_string();

    let mut channels: Vec<String> = raw_channels.split('|').map(String::from).collect();
    channels.sort_unstable();
    channels.dedup();

    if !backend.can_listen(&guid, &channels, &signature).await? {
        warn!(
            %guid,
            channels = %channels.join("|"),
            "client unauthorized listen attempt"
        );
        return Err(ApiError::Forbidden);
    }
    info!(%guid, channels = %channels.join("|"), "client is listening");

    let reader = backend.reader().await?;
    let stream = delivery_stream(backend, shutdown, reader, guid, channels);

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::new().interval(PING_INTERVAL).text("ping")),
    ))
}

fn delivery_stream(
    backend: Arc<Backend>,
    shutdown: CancellationToken,
    mut reader: crate::backend::StreamReader,
    guid: String,
    channels: Vec<String>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        'delivery: loop {
            let pulled = tokio::select! {
                biased;
                () = shutdown.cancelled() => None,
                result = reader.pull(&guid, &channels) => Some(result),
            };

            let Some(result) = pulled else {
                yield Ok(Event::default().event("reset").data("reset"));
                break;
            };

            match result {
                Ok(Pull::Batch(entries)) => {
                    for (id, message) in entries {
                        match serde_json::to_string(&message) {
                            Ok(data) => {
                                yield Ok(Event::default().event("whistle").data(data));
                            }
                            Err(error) => {
                                error!(%error, "failed to encode envelope");
                                continue;
                            }
                        }
                        // the frame is on its way out; persist progress
                        if let Err(error) = backend.ack(&message.channel, &guid, &id).await {
                            error!(%error, %guid, channel = %message.channel, "cursor update failed");
                            break 'delivery;
                        }
                    }
                }
                Ok(Pull::Unsubscribed) => {
                    info!(%guid, "listener unsubscribed from all requested channels");
                    break;
                }
                Err(error) => {
                    error!(%error, %guid, "stream read failed");
                    break;
                }
            }
        }
    }
}
