//! Unicity node CLI
//!
//! Runs a P2P node that syncs block headers with its peers.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use unicity_p2p::core::ChainType;
use unicity_p2p::network::{Node, NodeConfig, TcpTransport};
use unicity_p2p::util::SystemClock;

#[derive(Parser)]
#[command(name = "unicity-node")]
#[command(version = "0.1.0")]
#[command(about = "Headers-first proof-of-work P2P node", long_about = None)]
struct Cli {
    /// JSON config file; command line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the P2P node
    Start {
        /// Chain to follow (main, test, regtest)
        #[arg(long)]
        chain: Option<ChainType>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Peers to connect to (comma-separated host:port)
        #[arg(long, value_delimiter = ',')]
        connect: Vec<SocketAddr>,

        /// Data directory for the ban list and address book
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Do not accept inbound connections
        #[arg(long)]
        no_listen: bool,

        /// Maximum inbound connections
        #[arg(long)]
        max_inbound: Option<usize>,

        /// Maximum outbound connections
        #[arg(long)]
        max_outbound: Option<usize>,

        /// Disable feeler connections
        #[arg(long)]
        no_feelers: bool,

        /// Mine this many blocks before connecting (regtest only)
        #[arg(long, default_value = "0")]
        generate: usize,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Start {
            chain,
            port,
            connect,
            data_dir,
            no_listen,
            max_inbound,
            max_outbound,
            no_feelers,
            generate,
        } => {
            if let Some(chain) = chain {
                config.chain = chain;
            }
            if port.is_some() {
                config.port = port;
            }
            config.connect.extend(connect);
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            if no_listen {
                config.listen = false;
            }
            if let Some(max) = max_inbound {
                config.max_inbound = max;
            }
            if let Some(max) = max_outbound {
                config.max_outbound = max;
            }
            if no_feelers {
                config.feelers = false;
            }

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(config, generate))?;
        }
    }

    Ok(())
}

async fn run_node(config: NodeConfig, generate: usize) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("Starting {} node on port {:?}", config.chain, config.port);
    let node = Node::new(config, Arc::new(TcpTransport), SystemClock::shared())?;

    if generate > 0 {
        let hashes = node.generate_blocks(generate, [0u8; 20]).await?;
        log::info!("Generated {} blocks", hashes.len());
    }

    // Handle Ctrl+C
    let handle = node.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutting down node...");
            handle.shutdown().await;
        }
    });

    node.start().await?;
    let status = node.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
