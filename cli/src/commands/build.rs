//! `modpack build` command.

use std::path::PathBuf;

use clap::Args;
use modpack_core::PackConfig;
use modpack_runtime::BuildOptions;

#[derive(Args)]
pub struct BuildArgs {
    /// Path to the build spec
    #[arg(short = 'f', long = "file", default_value = "modpack.yaml")]
    pub file: PathBuf,

    /// Target reference, e.g. "registry.example.com/org/model:v1"
    #[arg(short, long)]
    pub target: String,

    /// Push layers straight to the registry instead of the local store
    #[arg(long)]
    pub output_remote: bool,

    /// Attach chunk checksums for lazy loading
    #[arg(long)]
    pub nydusify: bool,

    /// Store files verbatim (the default)
    #[arg(long, conflicts_with = "tar")]
    pub raw: bool,

    /// Store each file as a single-entry tar archive
    #[arg(long)]
    pub tar: bool,

    /// Number of files built in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Use plain HTTP for the registry
    #[arg(long)]
    pub plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Directory the build spec patterns are relative to
    #[arg(default_value = ".")]
    pub work_dir: PathBuf,
}

pub async fn execute(args: BuildArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;
    let options = BuildOptions {
        concurrency: args.concurrency,
        output_remote: args.output_remote,
        nydusify: args.nydusify,
        raw: !args.tar,
        plain_http: args.plain_http,
        insecure: args.insecure,
    };

    // A relative spec path is looked up in the work dir
    let spec = if args.file.is_relative() && !args.file.exists() {
        args.work_dir.join(&args.file)
    } else {
        args.file.clone()
    };

    let cancel = super::interrupt_token();
    let manifest = backend
        .build(&spec, &args.work_dir, &args.target, &options, &cancel)
        .await?;

    println!("Built {}", args.target);
    println!("Digest: {}", manifest.digest);
    Ok(())
}
