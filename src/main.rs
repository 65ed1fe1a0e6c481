use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tracing::{error, info};

use stateset_cart as cart;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = cart::config::load_config().context("failed to load configuration")?;
    cart::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Storage backend (in-memory unless storage_backend = "database")
    let storage = cart::repositories::Storage::from_config(&cfg)
        .await
        .map_err(|e| {
            error!("Failed to initialize storage: {}", e);
            e
        })?;

    let catalog = cart::services::commerce::catalog::catalog_from_config(&cfg)?;

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(cart::events::EventSender::new(event_tx));
    tokio::spawn(cart::events::process_events(event_rx));

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;

    let state = Arc::new(cart::AppState::new(cfg, storage, catalog, event_sender));
    let app = cart::build_router(state);

    info!("stateset-cart listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
