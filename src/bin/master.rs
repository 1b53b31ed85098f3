//! Master binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tidemaster::common::{connection_string, Config};
use tidemaster::coordinator::ClusterStatus;
use tidemaster::MasterServer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tidemaster")]
#[command(about = "tidemaster: replicated master for a volume storage cluster", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a master server
    Serve {
        /// Address other masters use to reach this one
        #[arg(long)]
        ip: Option<String>,

        /// HTTP port
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for raft state
        #[arg(long)]
        mdir: Option<PathBuf>,

        /// All masters of the cluster, this one included (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Base election timeout is pulse * 500ms
        #[arg(long)]
        pulse_seconds: Option<u64>,

        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print a master's view of the cluster
    Status {
        /// Master to ask, host:port
        #[arg(long, default_value = "localhost:9333")]
        master: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            ip,
            port,
            mdir,
            peers,
            pulse_seconds,
            config,
        } => {
            // file and environment first, CLI flags win
            let mut config = Config::load(config.as_deref())?;
            init_tracing(&config.log_level);

            let master = &mut config.master;
            if let Some(ip) = ip {
                master.ip = ip;
            }
            if let Some(port) = port {
                master.port = port;
            }
            if let Some(mdir) = mdir {
                master.data_dir = mdir;
            }
            if !peers.is_empty() {
                master.peers = peers;
            }
            if let Some(pulse) = pulse_seconds {
                master.pulse_seconds = pulse;
            }
            master.validate()?;

            MasterServer::new(config.master).serve().await?;
        }
        Commands::Status { master } => {
            init_tracing("warn");
            let url = format!("{}/cluster/status", connection_string(&master));
            let status: ClusterStatus = reqwest::get(&url).await?.error_for_status()?.json().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
