//! `modpack fetch` command.

use std::path::PathBuf;

use clap::Args;
use modpack_core::PackConfig;
use modpack_runtime::FetchOptions;

#[derive(Args)]
pub struct FetchArgs {
    /// Artifact reference, e.g. "registry.example.com/org/model:v1"
    pub target: String,

    /// Directory to write the files into
    #[arg(short, long)]
    pub output: PathBuf,

    /// Glob pattern of the file paths to fetch; may be repeated
    #[arg(short, long = "pattern", required = true)]
    pub patterns: Vec<String>,

    /// Number of files downloaded in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Use plain HTTP for the registry
    #[arg(long)]
    pub plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,
}

pub async fn execute(args: FetchArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;
    let options = FetchOptions {
        output: args.output.clone(),
        patterns: args.patterns,
        concurrency: args.concurrency,
        plain_http: args.plain_http,
        insecure: args.insecure,
    };

    let cancel = super::interrupt_token();
    let layers = backend.fetch(&args.target, &options, &cancel).await?;
    for layer in &layers {
        println!("Fetched {}", layer.filepath());
    }
    println!("Fetched {} files to {}", layers.len(), args.output.display());
    Ok(())
}
