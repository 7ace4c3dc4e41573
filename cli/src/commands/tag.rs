//! `modpack tag` command - create a tag that refers to an existing artifact.

use clap::Args;
use modpack_core::PackConfig;

#[derive(Args)]
pub struct TagArgs {
    /// Source artifact reference
    pub source: String,

    /// Target artifact reference (new tag)
    pub target: String,
}

pub async fn execute(args: TagArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;
    backend.tag(&args.source, &args.target).await?;
    println!("{}", args.target);
    Ok(())
}
