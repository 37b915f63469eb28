use clap::{Parser, Subcommand};
use pyrepo::Host;
use pyrepo::config::HostConfig;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pyrepo",
    about = "Mirror Python packages from an index and publish a static simple index",
    version
)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = "pyrepo.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync repositories from their remote index (all with sync options by default)
    Sync { repositories: Vec<String> },
    /// Publish repositories (all with publish options by default)
    Publish { repositories: Vec<String> },
    /// Show the snapshot history of a repository
    Snapshots { repository: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns whether every run succeeded.
async fn run(cli: Cli) -> pyrepo::error::Result<bool> {
    let config = HostConfig::load(&cli.config).await?;
    let host = Host::open(config).await?;

    match cli.command {
        Command::Sync { repositories } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, finishing in-flight downloads");
                    on_signal.cancel();
                }
            });

            let names = selected(&host, repositories, |r| r.sync.is_some());
            let mut success = true;
            for name in names {
                let report = host.run_sync(&name, cancel.clone()).await?;
                success &= report.is_success();
                print_json(&report)?;
            }
            Ok(success)
        }
        Command::Publish { repositories } => {
            let names = selected(&host, repositories, |r| r.publish.is_some());
            let mut success = true;
            for name in names {
                let report = host.run_publish(&name).await?;
                success &= report.is_success();
                print_json(&report)?;
            }
            Ok(success)
        }
        Command::Snapshots { repository } => {
            print_json(&host.snapshots(&repository)?)?;
            Ok(true)
        }
    }
}

/// Explicit names, or every configured repository matching `filter`.
fn selected(
    host: &Host,
    explicit: Vec<String>,
    filter: impl Fn(&pyrepo::config::RepositoryConfig) -> bool,
) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit;
    }
    host.config()
        .repositories
        .iter()
        .filter(|(_, r)| filter(r))
        .map(|(name, _)| name.clone())
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> pyrepo::error::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
