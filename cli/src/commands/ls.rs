//! `modpack ls` command.

use clap::Args;
use modpack_core::PackConfig;

use crate::output;

#[derive(Args)]
pub struct LsArgs {
    /// Only show references (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: LsArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;
    let artifacts = backend.list().await?;

    if args.quiet {
        for artifact in &artifacts {
            println!("{}:{}", artifact.repository, artifact.tag);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "DIGEST", "CREATED", "SIZE"]);
    for artifact in &artifacts {
        let created = artifact
            .created
            .as_ref()
            .map(output::format_ago)
            .unwrap_or_else(|| "<unknown>".to_string());
        table.add_row(vec![
            artifact.repository.clone(),
            artifact.tag.clone(),
            output::short_digest(&artifact.digest),
            created,
            output::format_bytes(artifact.size),
        ]);
    }

    println!("{table}");
    Ok(())
}
