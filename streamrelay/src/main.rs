mod server;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing::info;

use streamrelay_core::{
    bootstrap::{load_config, ConfigOverrides},
    config::TransportKind,
    logging, MemoryTransport, PubSubTransport, RedisTransport, RelayCoordinator,
};

use server::RelayServer;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Redis,
    Memory,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Redis => Self::Redis,
            TransportArg::Memory => Self::Memory,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "streamrelay")]
#[command(about = "Relay a pub/sub topic to WebSocket viewers", long_about = None)]
struct Args {
    /// Path to a YAML/TOML config file
    #[arg(short, long, env = "STREAMRELAY_CONFIG_PATH")]
    config: Option<String>,

    /// HTTP/WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream topic to relay
    #[arg(long)]
    topic: Option<String>,

    /// Upstream transport
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration (fails fast)
    let overrides = ConfigOverrides {
        port: args.port,
        topic: args.topic,
        transport: args.transport.map(Into::into),
    };
    let config = load_config(args.config.as_deref(), &overrides)?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("StreamRelay starting...");
    info!("HTTP address: {}", config.http_address());
    info!("Upstream topic: {}", config.upstream.topic);

    // 3. Select the upstream transport
    let transport: Arc<dyn PubSubTransport> = match config.upstream.transport {
        TransportKind::Redis => {
            info!("Upstream transport: redis ({})", config.upstream.redis_url);
            Arc::new(RedisTransport::new(
                config.upstream.redis_url.clone(),
                config.upstream.operation_timeout(),
            ))
        }
        TransportKind::Memory => {
            info!("Upstream transport: in-memory");
            Arc::new(MemoryTransport::new())
        }
    };

    // 4. Start the relay coordinator
    let (relay, relay_task) = RelayCoordinator::spawn(&config, transport);

    // 5. Serve until a shutdown signal
    RelayServer::new(Arc::new(config), relay, relay_task)
        .start()
        .await
}
