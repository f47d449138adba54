use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use wahub_core::{
    select_backend, EventBroadcaster, MetricsCollector, Orchestrator, PortAllocator, Registry,
    SessionPoller, Settings,
};

mod api;
mod ws;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    info!(mode = ?settings.mode, "starting wahub");

    let adapter = select_backend(&settings.backend_config()).await?;
    let registry = Registry::connect(&settings.database_path).await?;

    let broadcaster = Arc::new(EventBroadcaster::new());
    let allocator = PortAllocator::new(registry.clone(), settings.port_min, settings.port_max);
    let poller = SessionPoller::new(Arc::clone(&adapter), settings.poll_timeout)?;
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::clone(&adapter),
        allocator,
        Arc::clone(&broadcaster),
        poller,
        settings.mode,
        settings.stop_grace,
    ));

    let collector = Arc::new(MetricsCollector::new(
        registry,
        adapter,
        Arc::clone(&broadcaster),
        settings.metrics_interval,
    ));
    collector.start().await;

    // Hourly retention sweep for metric samples.
    let retention = settings.metrics_retention;
    let pruner = Arc::clone(&collector);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = pruner.prune(retention).await {
                tracing::warn!("metric retention sweep failed: {e}");
            }
        }
    });

    let app = api::router(api::AppState {
        orchestrator,
        collector,
        broadcaster,
    });

    let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
    info!("listening on {}", settings.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
