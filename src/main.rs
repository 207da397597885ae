// main.rs - syncline-server binary entry point

use anyhow::Context;
use std::sync::Arc;
use syncline::metrics::SyncMetrics;
use syncline::resolver::ConflictResolver;
use syncline::server::{router, AppContext, BroadcasterConfig, EventBroadcaster, ReplicationService};
use syncline::ServerConfig;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("failed to parse configuration")?;

    let filter = EnvFilter::try_new(&config.log_level)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to build log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if config.enable_cors {
        // CORS is terminated by the fronting proxy in our deployments.
        tracing::info!(
            "CORS requested for origins {:?}; mount it on the reverse proxy",
            config.cors_allowed_origins
        );
    }

    let metrics = SyncMetrics::new();
    let broadcaster = EventBroadcaster::new(BroadcasterConfig::default(), metrics.clone());
    let service = ReplicationService::open(
        &config,
        ConflictResolver::ServerWins,
        metrics.clone(),
        broadcaster.clone(),
    )
    .await
    .with_context(|| format!("failed to open storage at {}", config.db_path.display()))?;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    broadcaster.spawn_keep_alive(shutdown_rx);

    let addr = config.bind_addr();
    let app = router(AppContext {
        service,
        broadcaster,
        metrics,
        config: Arc::new(config),
    });

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("syncline-server listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
