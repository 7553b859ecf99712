use std::{env, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;

use device::{DeviceEndpoint, DeviceState, PropertyAnnouncer};
use discovery::{net, DeviceCategory, DiscoveryService, ServiceInfo, ServiceKind, Transport};

/// Cadence of randomized sensor readings.
const SENSOR_UPDATE_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_TTL_SECONDS: u32 = 60;

#[derive(Parser)]
#[command(name = "device")]
#[command(about = "Runs one device endpoint on the local fabric", long_about = None)]
struct Cli {
    /// Human-readable instance name; defaults to the category name
    #[arg(long)]
    name: Option<String>,

    /// Advertised TTL in seconds
    #[arg(long, default_value_t = DEFAULT_TTL_SECONDS)]
    ttl: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a light lamp actuator
    LightLamp,
    /// Run a sink actuator
    Sink,
    /// Run a toilet actuator
    Toilet,
    /// Run a fart detector sensor
    FartDetector,
    /// Run a water leak sensor
    WaterLeak,
}

impl Commands {
    fn category(&self) -> DeviceCategory {
        match self {
            Commands::LightLamp => DeviceCategory::LightLamp,
            Commands::Sink => DeviceCategory::Sink,
            Commands::Toilet => DeviceCategory::Toilet,
            Commands::FartDetector => DeviceCategory::FartDetector,
            Commands::WaterLeak => DeviceCategory::WaterLeak,
        }
    }
}

fn default_name(category: DeviceCategory) -> &'static str {
    match category {
        DeviceCategory::LightLamp => "Light Lamp",
        DeviceCategory::Sink => "Sink",
        DeviceCategory::Toilet => "Toilet",
        DeviceCategory::FartDetector => "Fart Detector",
        DeviceCategory::WaterLeak => "Water Leak",
    }
}

/// `PORT` overrides the listener port; absent means an ephemeral port. A
/// value that is not a valid 16-bit unsigned integer is fatal.
fn resolve_port() -> Result<u16> {
    match env::var("PORT") {
        Ok(value) => value
            .trim()
            .parse::<u16>()
            .with_context(|| format!("PORT value {:?} is not a 16-bit unsigned integer", value)),
        Err(env::VarError::NotPresent) => Ok(0),
        Err(e) => Err(e).context("PORT is not valid unicode"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.ttl == 0 {
        bail!("--ttl 0 would announce an immediate goodbye");
    }

    let category = cli.command.category();
    let port = resolve_port()?;

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind device listener on port {}", port))?;
    let port = listener.local_addr()?.port();

    let addresses = net::local_ipv4_addresses();
    if addresses.is_empty() {
        warn!("No routable IPv4 addresses found; announcements will carry no A records");
    }

    let state = {
        let mut rng = rand::thread_rng();
        DeviceState::seeded(category, &mut rng)
    };

    let info = ServiceInfo {
        instance_name: cli
            .name
            .unwrap_or_else(|| default_name(category).to_string()),
        service_type: category.service_type().to_string(),
        port,
        addresses,
        kind: category.kind(),
        category,
        transport: Transport::Tcp,
        properties: state.properties(),
        ttl_seconds: cli.ttl,
    };

    let discovery = Arc::new(DiscoveryService::new());
    let root = CancellationToken::new();

    discovery.listen(root.child_token()).await?;
    discovery.start_renovation(root.child_token()).await?;

    let committed = discovery.register(info).await?;
    info!("Registered {} on port {}", committed.fqdn(), port);

    let endpoint = Arc::new(DeviceEndpoint::new(
        listener,
        discovery.clone() as Arc<dyn PropertyAnnouncer>,
        committed,
        state,
    ));

    let endpoint_task = {
        let endpoint = endpoint.clone();
        let token = root.child_token();
        tokio::spawn(async move { endpoint.run(token).await })
    };

    if category.kind() == ServiceKind::Sensor {
        let endpoint = endpoint.clone();
        let token = root.child_token();
        tokio::spawn(async move {
            endpoint.run_sensor_loop(SENSOR_UPDATE_PERIOD, token).await;
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    root.cancel();
    if let Ok(result) = endpoint_task.await {
        result?;
    }
    discovery.shutdown().await;

    Ok(())
}
