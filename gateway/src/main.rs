use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;

use discovery::{DiscoveryService, RecordType, SERVICE_META_NAME};
use gateway::{
    http_api::create_router,
    ingest::spawn_ingest,
    probe::{spawn_sweeper, SweepConfig},
    DeviceRegistry,
};

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Aggregates fabric devices into a queryable registry", long_about = None)]
struct Cli {
    /// HTTP API port
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Seconds between liveness/expiry sweeps
    #[arg(long, default_value_t = 60)]
    sweep_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let root = CancellationToken::new();

    let registry = Arc::new(DeviceRegistry::new());
    let discovery = Arc::new(DiscoveryService::new());

    // The gateway never registers a service of its own; it only listens.
    discovery.listen(root.child_token()).await?;
    let ingest_task = spawn_ingest(
        registry.clone(),
        discovery.subscribe_inbound(),
        root.child_token(),
    );

    // Ask already-running devices to announce themselves right away.
    if let Err(e) = discovery.query(SERVICE_META_NAME, RecordType::Ptr).await {
        warn!("Initial discovery query failed: {}", e);
    }

    let sweeper_task = spawn_sweeper(
        registry.clone(),
        SweepConfig {
            interval: Duration::from_secs(cli.sweep_interval),
            ..SweepConfig::default()
        },
        root.child_token(),
    );

    let router = create_router(registry);
    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind HTTP listener on port {}", cli.port))?;
    info!("Gateway API listening on port {}", cli.port);

    let shutdown = root.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            shutdown.cancel();
        })
        .await
        .context("HTTP server failed")?;

    root.cancel();
    let _ = sweeper_task.await;
    let _ = ingest_task.await;
    discovery.shutdown().await;

    Ok(())
}
