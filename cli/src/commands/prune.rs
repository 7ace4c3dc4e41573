//! `modpack prune` command.

use clap::Args;
use modpack_core::PackConfig;

#[derive(Args)]
pub struct PruneArgs {
    /// Show what would be removed without removing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Also remove manifests no tag refers to
    #[arg(long)]
    pub remove_untagged: bool,
}

pub async fn execute(args: PruneArgs, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(config)?;
    let report = backend.prune(args.dry_run, args.remove_untagged).await?;

    if report.pruned.is_empty() {
        println!("Nothing to prune.");
    } else {
        let verb = if args.dry_run { "Would remove" } else { "Removed" };
        for blob in &report.pruned {
            println!("{verb}: {blob}");
        }
        println!("{verb} {} blob(s)", report.pruned.len());
    }

    if !report.failed.is_empty() {
        eprintln!("\nErrors:");
        for (repo, err) in &report.failed {
            eprintln!("  {repo}: {err}");
        }
    }
    Ok(())
}
