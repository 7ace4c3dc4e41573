//! `modpack attach` command.

use std::path::PathBuf;

use clap::Args;
use modpack_core::PackConfig;
use modpack_runtime::{AttachOptions, LayerCategory};

#[derive(Args)]
pub struct AttachArgs {
    /// Artifact to attach the file to
    pub source: String,

    /// File to attach, relative to the work directory
    pub file: PathBuf,

    /// Store the result under this reference instead of the source
    #[arg(short, long)]
    pub target: Option<String>,

    /// Directory the file is recorded under in the artifact
    #[arg(long)]
    pub dest_dir: Option<String>,

    /// Layer category (config, model, code, dataset, doc); inferred from the
    /// file name by default
    #[arg(long, value_parser = parse_category)]
    pub category: Option<LayerCategory>,

    /// The file is a model config document replacing the artifact's config
    #[arg(long, conflicts_with_all = ["category", "dest_dir"])]
    pub config: bool,

    /// Replace a file already present at the same path
    #[arg(long)]
    pub force: bool,

    /// Store the file as a single-entry tar archive
    #[arg(long)]
    pub tar: bool,

    /// Read from and write to the registry instead of the local store
    #[arg(long)]
    pub output_remote: bool,

    /// Use plain HTTP for the registry
    #[arg(long)]
    pub plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Directory the file path is relative to
    #[arg(long, default_value = ".")]
    pub work_dir: PathBuf,
}

pub(crate) fn parse_category(name: &str) -> Result<LayerCategory, String> {
    LayerCategory::ALL
        .into_iter()
        .find(|c| c.name() == name)
        .ok_or_else(|| format!("unknown category '{}'", name))
}

pub async fn execute(args: AttachArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;
    let options = AttachOptions {
        target: args.target.clone(),
        dest_dir: args.dest_dir,
        category: args.category,
        config: args.config,
        force: args.force,
        raw: !args.tar,
        output_remote: args.output_remote,
        plain_http: args.plain_http,
        insecure: args.insecure,
    };

    let cancel = super::interrupt_token();
    let manifest = backend
        .attach(&args.source, &args.file, &args.work_dir, &options, &cancel)
        .await?;

    let target = args.target.as_deref().unwrap_or(&args.source);
    println!("Attached {} to {}", args.file.display(), target);
    println!("Digest: {}", manifest.digest);
    Ok(())
}
