//! CLI for volume operations

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use volplane::client::{Client, ReadOptions};
use volplane::structs::{Volume, DEFAULT_NAMESPACE};

#[derive(Parser)]
#[command(name = "volplane")]
#[command(about = "volplane volume control plane CLI")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(long, env = "VOLPLANE_ADDR", default_value = "http://127.0.0.1:4646")]
    address: String,

    /// ACL token or node secret
    #[arg(long, env = "VOLPLANE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Volume commands
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// List volumes
    List {
        /// Namespace (all visible namespaces if omitted)
        #[arg(long)]
        namespace: Option<String>,

        /// Only volumes using this driver
        #[arg(long)]
        driver: Option<String>,

        /// Allow a follower to answer
        #[arg(long)]
        stale: bool,
    },

    /// Show one volume
    Status {
        id: String,

        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Register volumes from a JSON file (one volume or an array)
    Register {
        file: PathBuf,

        #[arg(long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
    },

    /// Deregister a volume
    Deregister {
        id: String,

        #[arg(long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
    },
}

fn load_volumes(path: &PathBuf) -> anyhow::Result<Vec<Volume>> {
    let raw = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let volumes = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(volumes)
}

fn print_table(volumes: &[Volume]) {
    println!(
        "{:<24} {:<24} {:<12} {:>6} {:>6} {:>8}",
        "ID", "Driver", "Namespace", "Claim", "Max", "Created"
    );
    for v in volumes {
        println!(
            "{:<24} {:<24} {:<12} {:>6} {:>6} {:>8}",
            v.id, v.driver, v.namespace, v.claim, v.max_claim, v.created_index
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = Client::new(cli.address, cli.token);

    match cli.command {
        Commands::Volume { command } => match command {
            VolumeCommands::List {
                namespace,
                driver,
                stale,
            } => {
                let opts = ReadOptions {
                    namespace,
                    driver,
                    stale,
                    ..Default::default()
                };
                let (volumes, meta) = client.list_volumes(&opts).await?;
                if volumes.is_empty() {
                    println!("No volumes");
                } else {
                    print_table(&volumes);
                }
                if !meta.known_leader {
                    eprintln!("warning: the answering server knows no leader");
                }
            }

            VolumeCommands::Status { id, json } => {
                let (volume, _) = client.volume(&id, &ReadOptions::default()).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&volume)?);
                } else {
                    println!("ID            = {}", volume.id);
                    println!("Driver        = {}", volume.driver);
                    println!("Namespace     = {}", volume.namespace);
                    println!("Claims        = {}/{}", volume.claim, volume.max_claim);
                    println!("Read many     = {}", volume.mode_read_many);
                    println!("Write one     = {}", volume.mode_write_one);
                    for (key, value) in &volume.topology {
                        println!("Topology      = {key}={value}");
                    }
                    println!("Create index  = {}", volume.created_index);
                    println!("Modify index  = {}", volume.modified_index);
                }
            }

            VolumeCommands::Register { file, namespace } => {
                let volumes = load_volumes(&file)?;
                let meta = client.register_volumes(&volumes, &namespace).await?;
                println!("Registered {} volume(s) at index {}", volumes.len(), meta.index);
            }

            VolumeCommands::Deregister { id, namespace } => {
                let meta = client.deregister_volume(&id, &namespace).await?;
                println!("Deregistered {id} at index {}", meta.index);
            }
        },
    }

    Ok(())
}
