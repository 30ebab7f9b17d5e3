use leases::{
    api,
    config::LeaseManagerConfig,
    network::NetworkHub,
    reboot::{RebootTracker, ServerHealthState},
    scheduler::WorkerPool,
    Error, LeaseManager, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = LeaseManagerConfig::from_env()?;
    let local = config.local_peer();
    info!(local = %local, bind_addr = %config.bind_addr, "Lease node starting");

    let pool = WorkerPool::start(config.scheduler_threads)?;

    // A standalone node only knows about itself until a cluster view is pushed in
    let tracker = Arc::new(RebootTracker::with_state(HashMap::from([(
        local.server_id.clone(),
        ServerHealthState::good(local.reboot_id.0),
    )])));

    let hub = NetworkHub::new();
    let manager = LeaseManager::builder(local.clone())
        .config(config.clone())
        .scheduler(pool.clone())
        .network(hub.handle(local))
        .tracker(tracker)
        .build()?;
    hub.register(&manager);

    let app = api::router(manager);
    let listener = TcpListener::bind(config.bind_addr).await?;

    info!("Lease node listening on {}", config.bind_addr);
    info!("API endpoints:");
    info!("  GET    {} - lease report", api::LEASE_MANAGER_PATH);
    info!("  DELETE {} - abort leases", api::LEASE_MANAGER_PATH);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Io)?;

    pool.shutdown().await;
    info!("Lease node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
