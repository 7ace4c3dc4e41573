//! Modpack CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use modpack_cli::commands::{dispatch, Cli};
use modpack_core::PackConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match PackConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over --debug and the configured level
    let fallback = if cli.debug {
        "debug"
    } else {
        config.log_level.as_directive()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli, config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
