//! CLI command definitions and dispatch.

mod attach;
mod build;
mod extract;
mod fetch;
mod inspect;
mod ls;
mod prune;
mod pull;
mod push;
mod rm;
mod tag;
mod version;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use modpack_core::PackConfig;
use modpack_runtime::{Backend, TracingProgress};
use tokio_util::sync::CancellationToken;

/// Modpack - package model files as OCI artifacts.
#[derive(Parser)]
#[command(name = "modpack", version, about)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build a model artifact from a build spec
    Build(build::BuildArgs),
    /// Add or replace one file in an existing artifact
    Attach(attach::AttachArgs),
    /// List artifacts in the local store
    Ls(ls::LsArgs),
    /// Remove an artifact tag or manifest
    Rm(rm::RmArgs),
    /// Remove unreferenced blobs from the local store
    Prune(prune::PruneArgs),
    /// Create a tag that refers to an existing artifact
    Tag(tag::TagArgs),
    /// Display detailed artifact information as JSON
    Inspect(inspect::InspectArgs),
    /// Write the files of an artifact into a directory
    Extract(extract::ExtractArgs),
    /// Push an artifact to its registry
    Push(push::PushArgs),
    /// Pull an artifact from its registry
    Pull(pull::PullArgs),
    /// Download selected files of a remote artifact
    Fetch(fetch::FetchArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Open the backend over the configured local store.
pub(crate) fn open_backend(config: PackConfig) -> Result<Backend, Box<dyn std::error::Error>> {
    let backend = Backend::new(config)?.with_observer(Arc::new(TracingProgress));
    Ok(backend)
}

/// Token cancelled on Ctrl-C.
pub(crate) fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: PackConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args, config).await,
        Command::Attach(args) => attach::execute(args, config).await,
        Command::Ls(args) => ls::execute(args, config).await,
        Command::Rm(args) => rm::execute(args, config).await,
        Command::Prune(args) => prune::execute(args, config).await,
        Command::Tag(args) => tag::execute(args, config).await,
        Command::Inspect(args) => inspect::execute(args, config).await,
        Command::Extract(args) => extract::execute(args, config).await,
        Command::Push(args) => push::execute(args, config).await,
        Command::Pull(args) => pull::execute(args, config).await,
        Command::Fetch(args) => fetch::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_build() {
        let cli = Cli::parse_from([
            "modpack", "build", "-f", "spec.yaml", "-t", "example.com/m:v1", "--tar", "--debug", ".",
        ]);
        assert!(cli.debug);
        match cli.command {
            Command::Build(args) => {
                assert_eq!(args.target, "example.com/m:v1");
                assert!(args.tar);
                assert_eq!(args.work_dir.to_str(), Some("."));
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_parse_attach() {
        let cli = Cli::parse_from([
            "modpack", "attach", "example.com/m:v1", "src/train.py", "--category", "code", "--force",
        ]);
        match cli.command {
            Command::Attach(args) => {
                assert_eq!(args.source, "example.com/m:v1");
                assert_eq!(args.category, Some(modpack_runtime::LayerCategory::Code));
                assert!(args.force);
                assert!(!args.tar);
            }
            _ => panic!("expected attach"),
        }
        assert!(Cli::try_parse_from(["modpack", "attach", "m:v1", "f", "--category", "weights"]).is_err());
        assert!(Cli::try_parse_from(["modpack", "attach", "m:v1", "f", "--config", "--dest-dir", "d"]).is_err());
    }

    #[test]
    fn test_parse_fetch_requires_pattern() {
        assert!(Cli::try_parse_from(["modpack", "fetch", "example.com/m:v1", "-o", "out"]).is_err());
        let cli = Cli::parse_from([
            "modpack", "fetch", "example.com/m:v1", "-o", "out", "-p", "*.json", "--pattern", "*.md",
        ]);
        match cli.command {
            Command::Fetch(args) => assert_eq!(args.patterns, vec!["*.json", "*.md"]),
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_parse_extract_requires_output() {
        assert!(Cli::try_parse_from(["modpack", "extract", "example.com/m:v1"]).is_err());
        assert!(Cli::try_parse_from(["modpack", "extract", "example.com/m:v1", "-o", "out"]).is_ok());
    }
}
