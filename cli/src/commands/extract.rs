//! `modpack extract` command.

use std::path::PathBuf;

use clap::Args;
use modpack_core::PackConfig;
use modpack_runtime::ExtractOptions;

#[derive(Args)]
pub struct ExtractArgs {
    /// Artifact reference
    pub target: String,

    /// Directory to write the files into
    #[arg(short, long)]
    pub output: PathBuf,

    /// Number of layers extracted in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,
}

pub async fn execute(args: ExtractArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let concurrency = args.concurrency.unwrap_or(config.concurrency);
    let backend = super::open_backend(config)?;
    let options = ExtractOptions {
        output: args.output.clone(),
        concurrency,
    };

    let cancel = super::interrupt_token();
    backend.extract(&args.target, &options, &cancel).await?;
    println!("Extracted {} to {}", args.target, args.output.display());
    Ok(())
}
