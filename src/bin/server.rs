//! Server binary

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volplane::common::PeerConfig;
use volplane::coordinator::http_transport;
use volplane::state::StateStore;
use volplane::{Config, Server};

#[derive(Parser)]
#[command(name = "volplane-server")]
#[command(about = "volplane control plane server")]
#[command(version)]
struct Cli {
    /// Node ID
    #[arg(long)]
    node_id: Option<String>,

    /// Bind address for the HTTP API
    #[arg(long)]
    bind: Option<String>,

    /// State directory
    #[arg(long)]
    data: Option<PathBuf>,

    /// Cluster peer as id=url (repeatable)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerConfig>,

    /// Start as the cluster leader
    #[arg(long)]
    bootstrap: bool,

    /// Leader ID when starting as a follower
    #[arg(long)]
    leader: Option<String>,

    /// Enable ACL enforcement
    #[arg(long)]
    acl: bool,

    /// Shared secret for the internal cluster routes
    #[arg(long)]
    rpc_secret: Option<String>,
}

fn parse_peer(raw: &str) -> Result<PeerConfig, String> {
    let (id, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected id=url, got {raw:?}"))?;
    Ok(PeerConfig {
        id: id.to_string(),
        addr: addr.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file and environment, then override with CLI arguments
    let mut config = Config::load()?;
    if let Some(id) = cli.node_id {
        config.node_id = id;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind.parse()?;
    }
    if let Some(data) = cli.data {
        config.data_dir = data;
    }
    if !cli.peers.is_empty() {
        config.peers = cli.peers;
    }
    if cli.bootstrap {
        config.bootstrap = true;
    }
    if cli.leader.is_some() {
        config.leader = cli.leader;
    }
    if cli.acl {
        config.acl.enabled = true;
    }
    if cli.rpc_secret.is_some() {
        config.rpc_secret = cli.rpc_secret;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::fs::create_dir_all(&config.data_dir)?;
    let state = Arc::new(StateStore::open(config.data_dir.join("state"))?);
    info!(
        index = state.log_index(),
        "Restored state from {}",
        config.data_dir.display()
    );

    let transport = http_transport(&config)?;
    let server = Arc::new(Server::new(config, state, transport)?);
    server.serve().await?;
    Ok(())
}
