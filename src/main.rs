use anyhow::Context;
use postmirror::aggregator::GroupAggregator;
use postmirror::api::{self, ApiState};
use postmirror::config::Config;
use postmirror::db::{Database, MessageStore};
use postmirror::ingest::IngestionHandler;
use postmirror::media::MediaStore;
use postmirror::telegram::{TelegramClient, UpdatePoller};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config);

    let db = Database::new(&config)?;
    db.execute_init()?;

    let media = MediaStore::new(&config.media_dir, &config.public_base_url)
        .context("Failed to prepare media directory")?;

    let client = Arc::new(TelegramClient::new(&config));
    let me = client
        .get_me()
        .await
        .context("Failed to authorize bot token")?;
    info!(
        "Bot authorized as @{}",
        me.username.as_deref().unwrap_or(&me.first_name)
    );

    let store: Arc<dyn MessageStore> = Arc::new(db.clone());
    let aggregator = GroupAggregator::new(store.clone(), config.media_group_debounce);
    let handler = Arc::new(IngestionHandler::new(
        client.clone(),
        media,
        store,
        aggregator.clone(),
    ));
    let poller = UpdatePoller::new(client, handler, &config);

    let app = api::router(ApiState { db }, &config);
    let address = config.api_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    info!("Read API listening on {}", address);

    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {}", e);
        }
    });

    tokio::select! {
        _ = poller.run() => warn!("Poller stopped unexpectedly"),
        _ = shutdown_signal() => {}
    }

    info!("Shutting down...");
    // Posts still downloading land in their groups before the final flush
    poller.drain().await;
    let flushed = aggregator.shutdown().await;
    if flushed > 0 {
        info!("Flushed {} pending media group(s)", flushed);
    }
    api_handle.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
