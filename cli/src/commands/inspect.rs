//! `modpack inspect` command.

use clap::Args;
use modpack_core::PackConfig;

#[derive(Args)]
pub struct InspectArgs {
    /// Artifact reference
    pub target: String,

    /// Read the artifact from its registry instead of the local store
    #[arg(long)]
    pub remote: bool,

    /// Use plain HTTP for the registry
    #[arg(long)]
    pub plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,
}

pub async fn execute(args: InspectArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;
    let inspected = backend
        .inspect(&args.target, args.remote, args.plain_http, args.insecure)
        .await?;
    println!("{}", serde_json::to_string_pretty(&inspected)?);
    Ok(())
}
