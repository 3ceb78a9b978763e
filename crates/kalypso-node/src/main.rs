use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod logging;
mod simulate;

use config::{system_address, NodeConfig};

const DEFAULT_CONFIG: &str = "./kalypso.toml";

#[derive(Parser)]
#[command(name = "kalypso-node")]
#[command(about = "Kalypso proof marketplace node", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Load, override and validate the configuration
    CheckConfig,

    /// Run one in-memory marketplace round and print a summary
    Simulate {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Config file, then environment overrides.
fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let mut config = match path {
        Some(path) => NodeConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => NodeConfig::from_file(Path::new(DEFAULT_CONFIG))?,
        None => NodeConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref());
    let logging_config = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();

    if let Err(e) = logging::init_logging(&logging_config, cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
        let log_level = logging::effective_level(&logging_config, cli.verbose);
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| format!("kalypso={}", log_level)),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    match cli.command {
        Commands::Init { output, force } => {
            if output.exists() && !force {
                bail!("{} already exists, pass --force to overwrite", output.display());
            }
            NodeConfig::default().save(&output)?;
            info!(path = %output.display(), "⚙️ Default configuration written");
        }
        Commands::CheckConfig => {
            let config = config?;
            config.validate().context("configuration is invalid")?;
            info!(node = %config.node.name, "✅ Configuration valid");
            println!("marketplace      {}", system_address("marketplace"));
            println!("prover registry  {}", system_address("prover-registry"));
            println!("native pool      {}", system_address("native-staking"));
            println!("symbiotic pool   {}", system_address("symbiotic-staking"));
            println!("payment token    {}", config.payment_token()?);
            println!("stake token      {}", config.stake_token()?);
            println!("treasury         {}", config.treasury()?);
        }
        Commands::Simulate { json } => {
            let config = config?;
            info!(node = %config.node.name, "🧬 Starting local round");
            let stack = simulate::LocalStack::build(&config).await?;
            let summary = match stack.run_round().await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(error = %e, "❌ Local round failed");
                    return Err(e);
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary);
            }
        }
    }

    Ok(())
}
