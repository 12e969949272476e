//! `conductor` binary: daemon and socket ping.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use conductor::api::server;
use conductor::config::Config;
use conductor::utils::paths;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version)]
#[command(about = "Control plane for interactive coding-agent sessions")]
#[command(long_about = "\
conductor tracks projects, repositories, tasks, conversations, and live
coding-agent sessions, and streams observed events to connected clients.

The daemon owns a SQLite store and a unix socket; clients speak JSON
lines over the socket. Background pollers keep git status fresh and
reconcile GitHub pull requests per tracked branch.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    RUST_LOG              Log level filter (default: conductor=info)
    CONDUCTOR_DATABASE    Database path override
    CONDUCTOR_SOCKET      Socket path override
    GITHUB_TOKEN          GitHub API token (else `gh auth token`)
    LINEAR_API_KEY        Linear API key (name configurable)")]
struct Cli {
    /// Config file path (default: ~/.conductor/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon.
    Serve {
        /// Log to a file under the data directory instead of stderr.
        #[arg(long)]
        log_file: bool,
    },
    /// Ping a running daemon over its socket.
    Status,
}

fn init_tracing(log_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conductor=info"));

    if log_file {
        let appender = tracing_appender::rolling::daily(paths::log_dir(), "conductor.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(filter),
            )
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(filter))
            .init();
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { log_file } => {
            let _guard = init_tracing(log_file);
            server::run_daemon(config).await
        }
        Commands::Status => {
            let _guard = init_tracing(false);
            let line = server::ping(&config).await?;
            tracing::info!(response = %line, "daemon is up");
            Ok(())
        }
    }
}
