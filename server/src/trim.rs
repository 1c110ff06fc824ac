//! Background log-trimming task.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::Backend;

/// Trim every channel on a fixed interval until cancelled. A store failure
/// is logged and retried on the next tick.
pub async fn run(backend: Arc<Backend>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("trim task stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(error) = backend.trim_all().await {
                    warn!(%error, "channel trim failed");
                }
            }
        }
    }
}
