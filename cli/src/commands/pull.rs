//! `modpack pull` command.

use clap::Args;
use modpack_core::PackConfig;
use modpack_runtime::TransferOptions;

#[derive(Args)]
pub struct PullArgs {
    /// Artifact reference, e.g. "registry.example.com/org/model:v1"
    pub target: String,

    /// Number of blobs copied in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Use plain HTTP for the registry
    #[arg(long)]
    pub plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,
}

pub async fn execute(args: PullArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;
    let options = TransferOptions {
        concurrency: args.concurrency,
        plain_http: args.plain_http,
        insecure: args.insecure,
    };

    let cancel = super::interrupt_token();
    let manifest = backend.pull(&args.target, &options, &cancel).await?;
    println!("Pulled: {} ({})", args.target, manifest.digest);
    Ok(())
}
