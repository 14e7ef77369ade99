use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use shardfs::client::Client;
use shardfs::config::{
    CoordinatorConfig, Limits, StorageBackend, StorageNodeConfig, Timeouts, Topology,
    DEFAULT_COORDINATOR_ADDR,
};
use shardfs::net::Server;
use shardfs::{coordinator, storage_node};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardfs", version, about = "Files sharded across storage nodes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator, which shards uploads across the storage nodes.
    Coordinator {
        #[arg(long, env = "SHARDFS_LISTEN", default_value = DEFAULT_COORDINATOR_ADDR)]
        listen: String,
        /// Storage node endpoints, in shard order.
        #[arg(
            long,
            env = "SHARDFS_NODES",
            default_value = "127.0.0.1:8001,127.0.0.1:8002,127.0.0.1:8003,127.0.0.1:8004"
        )]
        nodes: Topology,
        /// Largest file accepted for upload, in bytes.
        #[arg(long, env = "SHARDFS_MAX_PAYLOAD", default_value_t = Limits::default().max_payload)]
        max_payload: u64,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Run a storage node.
    Node {
        #[arg(long, env = "SHARDFS_LISTEN", default_value = "127.0.0.1:8001")]
        listen: String,
        #[arg(long, env = "SHARDFS_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
        /// Keep blobs in memory instead of `--data-dir`.
        #[arg(long, env = "SHARDFS_IN_MEMORY")]
        in_memory: bool,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Upload a local file under its file name.
    Upload {
        file: PathBuf,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Download a file, by default into the current directory.
    Download {
        name: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Args)]
struct ServerArgs {
    #[arg(long, env = "SHARDFS_MAX_CONNECTIONS", default_value_t = 1024)]
    max_connections: usize,
    /// Deadline for connecting to a storage node, in seconds.
    #[arg(long, env = "SHARDFS_CONNECT_TIMEOUT", default_value_t = 5)]
    connect_timeout: u64,
    /// Deadline for one exchange with a storage node, in seconds.
    #[arg(long, env = "SHARDFS_IO_TIMEOUT", default_value_t = 60)]
    io_timeout: u64,
    /// Deadline for serving one inbound connection, in seconds.
    #[arg(long, env = "SHARDFS_CONNECTION_TIMEOUT", default_value_t = 300)]
    connection_timeout: u64,
}

impl ServerArgs {
    fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout),
            io: Duration::from_secs(self.io_timeout),
            connection: Duration::from_secs(self.connection_timeout),
        }
    }
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, env = "SHARDFS_COORDINATOR", default_value = DEFAULT_COORDINATOR_ADDR)]
    coordinator: String,
    /// Deadline for the whole transfer, in seconds.
    #[arg(long, env = "SHARDFS_TIMEOUT", default_value_t = 300)]
    timeout: u64,
}

impl ClientArgs {
    fn client(&self) -> Client {
        let timeouts = Timeouts {
            io: Duration::from_secs(self.timeout),
            ..Timeouts::default()
        };
        Client::new(&self.coordinator, timeouts)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Coordinator {
            listen,
            nodes,
            max_payload,
            server,
        } => {
            let config = CoordinatorConfig {
                listen,
                topology: nodes,
                timeouts: server.timeouts(),
                limits: Limits {
                    max_payload,
                    max_connections: server.max_connections,
                },
            };
            let server = coordinator::spawn(config)
                .await
                .context("starting coordinator")?;
            run_until_shutdown(server).await
        }
        Command::Node {
            listen,
            data_dir,
            in_memory,
            server,
        } => {
            let storage = if in_memory {
                StorageBackend::Memory
            } else {
                StorageBackend::Disk(data_dir)
            };
            let config = StorageNodeConfig {
                listen,
                storage,
                timeouts: server.timeouts(),
                limits: Limits {
                    max_connections: server.max_connections,
                    ..StorageNodeConfig::default().limits
                },
            };
            let server = storage_node::spawn(config)
                .await
                .context("starting storage node")?;
            run_until_shutdown(server).await
        }
        Command::Upload { file, client } => {
            let len = client
                .client()
                .upload(&file)
                .await
                .with_context(|| format!("uploading {}", file.display()))?;
            println!("Uploaded {} ({len} bytes)", file.display());
            Ok(())
        }
        Command::Download {
            name,
            output,
            client,
        } => {
            let output = output.unwrap_or_else(|| PathBuf::from(&name));
            let len = client
                .client()
                .download(&name, &output)
                .await
                .with_context(|| format!("downloading {name}"))?;
            println!("Downloaded {name} to {} ({len} bytes)", output.display());
            Ok(())
        }
    }
}

async fn run_until_shutdown(server: Server) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}
