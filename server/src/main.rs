use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use marmot_server::{
    backend::Backend,
    config::Config,
    routes::{self, AppState},
    trim,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("marmot server {}", env!("CARGO_PKG_VERSION"));

    let config_path = PathBuf::from(
        std::env::var("MARMOT_CONFIG").unwrap_or_else(|_| "marmot.json".to_string()),
    );
    let config = Config::from_file(&config_path)?;
    let server = config.server.with_context(|| {
        format!(
            "cannot find server configuration in: {}",
            config_path.display()
        )
    })?;

    let host = std::env::var("MARMOT_HOST").unwrap_or_else(|_| server.host.clone());
    let port = match std::env::var("MARMOT_PORT") {
        Ok(value) => value.parse().context("invalid MARMOT_PORT")?,
        Err(_) => server.port,
    };

    let backend = Arc::new(Backend::new(&server.redis)?);
    info!("loading configuration into the stream store...");
    backend.load(&server).await?;

    let shutdown = CancellationToken::new();
    let trim_task = tokio::spawn(trim::run(
        backend.clone(),
        Duration::from_secs(server.redis.trim_freq),
        shutdown.clone(),
    ));

    let app = routes::router(AppState {
        backend,
        shutdown: shutdown.clone(),
    });
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("cannot bind {host}:{port}"))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                info!("shutting down...");
                // active listeners observe this, emit a reset event and close
                shutdown.cancel();
            }
        })
        .await?;

    shutdown.cancel();
    trim_task.await?;
    info!("bye.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
