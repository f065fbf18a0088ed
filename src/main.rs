use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dpos_chain::api;
use dpos_chain::blocks::LoadOutcome;
use dpos_chain::chain::Chain;
use dpos_chain::config::ChainConfig;
use dpos_chain::crypto::{generate_keypair, save_keypair};
use dpos_chain::interfaces::OfflineNetwork;

#[derive(Parser)]
#[command(author, version, about = "Delegated-proof-of-stake sidechain node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/chain.toml")]
        config: PathBuf,
    },
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/chain.toml")]
        path: PathBuf,
    },
    /// Generate a new Ed25519 keypair for the node
    Keygen {
        #[arg(short, long, default_value = "keys/node.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_node(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Keygen { path } => keygen(path)?,
    }

    Ok(())
}

async fn start_node(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        ChainConfig::load(&config_path)?
    } else {
        let config = ChainConfig::default();
        config.save(&config_path)?;
        config
    };

    let api_addr = config.api_listen;
    let chain = Chain::new(config, Arc::new(OfflineNetwork))?;
    if let LoadOutcome::RebuildCompleted { round } = chain.load_outcome() {
        info!(round, "rebuild complete, exiting");
        chain.cleanup(None);
        return Ok(());
    }
    let handle = chain.handle();
    let api_task = tokio::spawn(async move { api::serve(handle, api_addr).await });

    let result = tokio::select! {
        res = chain.start() => res.map_err(anyhow::Error::from),
        res = api_task => handle_join(res),
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    chain.cleanup(None);
    result?;
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = ChainConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf) -> Result<()> {
    let keypair = generate_keypair();
    save_keypair(&path, &keypair)?;
    info!(?path, "generated node keypair");
    Ok(())
}

fn handle_join(result: Result<dpos_chain::errors::ChainResult<()>, JoinError>) -> Result<()> {
    let inner = result?;
    inner?;
    Ok(())
}
