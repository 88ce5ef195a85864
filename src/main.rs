use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use prospector_rs::api;
use prospector_rs::config::AppConfig;
use prospector_rs::db::LeadDb;
use prospector_rs::driver::HelperDriver;
use prospector_rs::events::ServerEvent;
use prospector_rs::lock::BrowserLock;
use prospector_rs::runs::{ActiveSearchGuard, RunRegistry};
use prospector_rs::spider::HelperSpider;
use prospector_rs::state::AppState;
use prospector_rs::worker::ConnectWorker;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::load());

    let db = Arc::new(LeadDb::new(&config.database_path()).await?);
    let interrupted = db
        .expire_stale_claims(Duration::from_secs(config.claim_stale_seconds))
        .await?;
    if interrupted > 0 {
        warn!("marked {interrupted} interrupted connect items as failed");
    }

    let lock = Arc::new(BrowserLock::new(
        "browser-profile",
        Duration::from_secs(config.lock_stale_seconds),
    ));
    let driver = Arc::new(HelperDriver::from_config(&config));
    let spider = Arc::new(HelperSpider::from_config(&config));

    let (events_tx, _events_rx) = broadcast::channel::<ServerEvent>(1024);

    let worker = ConnectWorker::new(
        db.clone(),
        lock.clone(),
        driver.clone(),
        config.clone(),
        events_tx.clone(),
    );

    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        lock,
        driver,
        spider,
        worker: worker.clone(),
        registry: RunRegistry::new(db),
        active_search: Arc::new(ActiveSearchGuard::new()),
        events: events_tx,
    };

    let app = api::router(state);

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("prospector-rs listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    let _ = worker.stop().await;
    worker.join().await;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
