//! `modpack push` command.

use clap::Args;
use modpack_core::PackConfig;
use modpack_runtime::TransferOptions;

#[derive(Args)]
pub struct PushArgs {
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

pub async fn execute(args: PushArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;
    let options = TransferOptions {
        concurrency: args.concurrency,
        plain_http: args.plain_http,
        insecure: args.insecure,
    };

    let cancel = super::interrupt_token();
    let manifest = backend.push(&args.target, &options, &cancel).await?;
    println!("Pushed: {} ({})", args.target, manifest.digest);
    Ok(())
}
