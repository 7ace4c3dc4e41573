//! `modpack rm` command.

use clap::Args;
use modpack_core::PackConfig;

#[derive(Args)]
pub struct RmArgs {
    /// Artifact references (`repo:tag` or `repo@digest`)
    #[arg(required = true)]
    pub targets: Vec<String>,
}

pub async fn execute(args: RmArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;

    let mut errors: Vec<String> = Vec::new();
    for target in &args.targets {
        match backend.remove(target).await {
            Ok(removed) => println!("Deleted: {removed}"),
            Err(e) => errors.push(format!("{target}: {e}")),
        }
    }

    if !errors.is_empty() {
        return Err(errors.join("\n").into());
    }
    Ok(())
}
