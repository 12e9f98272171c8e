//! Shardstore node - serves one shard of a sharded document store

use clap::Parser;
use shardstore_node::{run_server_with_shutdown, NodeConfig};
use shardstore_provider::OpenOptions;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardstore-node")]
#[command(about = "Storage node of a sharded shardstore infrastructure")]
#[command(version)]
struct Args {
    /// Config file (TOML or JSON)
    #[arg(short, long, env = "SHARDSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Node name, as it appears in the shard tree
    #[arg(short, long, env = "SHARDSTORE_NAME")]
    name: Option<String>,

    /// Host to bind to
    #[arg(short = 'H', long, env = "SHARDSTORE_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SHARDSTORE_PORT")]
    port: Option<u16>,

    /// Store records as JSON files under this directory
    #[arg(long, env = "SHARDSTORE_DATA_DIR", conflicts_with = "memory")]
    data_dir: Option<PathBuf>,

    /// Use in-memory storage (data will not persist)
    #[arg(long)]
    memory: bool,

    /// Enable debug logging
    #[arg(short, long, env = "SHARDSTORE_DEBUG")]
    debug: bool,
}

impl Args {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = self.data_dir {
            config.storage = OpenOptions::fs(dir);
        } else if self.memory {
            config.storage = OpenOptions::memory();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("shardstore_node={},tower_http=debug", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = NodeConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    tracing::info!(
        "Starting shardstore node {} on {} ({} provider)",
        config.name,
        config.bind_addr(),
        config.storage.provider
    );

    run_server_with_shutdown(config, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c, shutting down");
        }
    })
    .await
}
