use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use portald::bootstrap::Server;
use portald::config::Config;
use portald::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "portald")]
#[command(author, version, about = "Captive-portal edge agent")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,

    /// Skip session restoration at startup
    #[arg(long)]
    no_restore: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig::from(&config.telemetry))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        contract_id = %config.contract_id,
        "starting portald"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    Server::new(config, args.no_restore).run().await
}
