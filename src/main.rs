//! nmq - connection-oriented message server
//!
//! Accepts TCP connections, frames payloads in an RFC6455-style binary wire
//! format and tags every connection and message with a snowflake id.

use clap::Parser;
use nmq_server::{
    run_metrics_server, Config, LoggingHandler, Metrics, Registry, Server, ServerConfig,
};
use nmq_snowflake::SnowNode;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nmq")]
#[command(about = "Connection-oriented message server with snowflake ids")]
#[command(version)]
struct Args {
    /// YAML config file
    #[arg(short, long, env = "NMQ_CONFIG")]
    config: Option<PathBuf>,

    /// Listener address, overrides the config file
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Listener network: tcp, tcp4 or tcp6
    #[arg(long)]
    network: Option<String>,

    /// Explicit node id, overrides the name-derived one
    #[arg(long)]
    node_id: Option<i64>,

    /// Node name used to derive the node id
    #[arg(long)]
    node_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load_from(args.config.as_ref()) {
        Ok(c) => {
            if let Some(ref path) = args.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    if let Some(bind) = args.bind {
        config.network.bind_addr = bind;
    }
    if let Some(network) = args.network {
        config.network.network = network;
    }
    if let Some(name) = args.node_name {
        config.node.name = name;
    }
    if let Some(id) = args.node_id {
        config.node.id = Some(id);
    }
    config.validate()?;

    let node_id = config.node.node_id()?;
    let generator = Arc::new(SnowNode::with_settings(node_id, config.node.settings()?)?);

    tracing::info!("Starting nmq server");
    tracing::info!(
        "  Listener: {} ({})",
        config.network.bind_addr,
        config.network.network
    );
    tracing::info!("  Node: {} (id {})", config.node.name, node_id);
    tracing::info!("  Max connections: {}", config.network.max_connections);

    let mut server_config = ServerConfig::from(&config.network);
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        tracing::info!("  Metrics: enabled ({})", config.metrics.bind_addr);
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(
        server_config,
        Arc::new(Registry::new()),
        generator,
        Arc::new(LoggingHandler),
    ));

    if let Some(metrics) = metrics {
        let addr = config.metrics.bind_addr;
        let shutdown = server.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let addr = server.start().await?;
    tracing::info!("Listening on {}", addr);

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        if let Err(e) = shutdown_server.stop() {
            tracing::warn!("Stop failed: {}", e);
        }
    });

    server.join().await?;

    tracing::info!("Server stopped");
    Ok(())
}
