use anyhow::{Context, Result};
use clap::Parser;
use kroncache::{DurabilityMode, KronServer, OverflowPolicy, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Ephemeral key-value store with expiring, recurring and batched records.
#[derive(Debug, Parser)]
#[command(name = "kroncache", version, about)]
struct Cli {
    /// Listen host [env: KRONCACHE_HOST]
    #[arg(long)]
    host: Option<String>,

    /// Listen port [env: KRONCACHE_PORT, default 8080]
    #[arg(long)]
    port: Option<u16>,

    /// Directory for the WAL and snapshots; memory only when omitted [env: KRONCACHE_DATA_DIR]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Scheduler tick in milliseconds [env: KRONCACHE_TICK_MS, default 1000]
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Events buffered per connection
    #[arg(long)]
    capacity: Option<usize>,

    /// What a full connection queue does: drop-oldest or disconnect
    #[arg(long)]
    overflow: Option<OverflowPolicy>,

    /// WAL fsync policy: sync, async or none
    #[arg(long)]
    durability: Option<DurabilityMode>,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = ServerConfig::from_env().context("failed to read config")?;
        if let Some(host) = self.host {
            config = config.host(&host);
        }
        if let Some(port) = self.port {
            config = config.port(port);
        }
        if let Some(dir) = self.data_dir {
            config = config.data_dir(dir);
        }
        if let Some(ms) = self.tick_ms {
            config = config.tick_interval(Duration::from_millis(ms));
        }
        if let Some(capacity) = self.capacity {
            config = config.subscriber_capacity(capacity);
        }
        if let Some(policy) = self.overflow {
            config = config.overflow_policy(policy);
        }
        if let Some(mode) = self.durability {
            config = config.durability(mode);
        }
        Ok(config)
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kroncache=info,tower_http=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Cli::parse().into_config()?;

    let server = KronServer::open(config).await?;
    server.run().await
}
