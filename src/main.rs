// ABOUTME: CLI entry point for booking-replicator
// ABOUTME: Parses commands and routes to the run, hook, watch, repair and diagnostic handlers

use clap::{Parser, Subcommand};
use booking_replicator::commands::{self, ConfigSource};
use booking_replicator::config::DEFAULT_CONFIG_PATH;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "booking-replicator")]
#[command(about = "Bidirectional replication between the local and hosted booking databases", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Local instance URL, overriding [local].url
    #[arg(long = "local-url", env = "REPLICATOR_LOCAL_URL", global = true, hide_env_values = true)]
    local_url: Option<String>,
    /// Remote instance URL, overriding [remote].url
    #[arg(long = "remote-url", env = "REPLICATOR_REMOTE_URL", global = true, hide_env_values = true)]
    remote_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain both queues once (scheduled/cron entry point)
    Run(commands::run::RunArgs),
    /// Best-effort inline sync after a write; never fails
    Hook(commands::run::HookArgs),
    /// Run sync at a fixed interval until Ctrl+C
    Watch(commands::run::WatchArgs),
    /// Converge rows changed within the last N hours, bypassing the queues
    ForceSync(commands::force_sync::ForceSyncArgs),
    /// Create the queue table and (re)install capture triggers on both instances
    InstallTriggers(commands::triggers::InstallArgs),
    /// Check that capture triggers exist, have valid definers and fire
    Probe(commands::triggers::ProbeArgs),
    /// Queue health and last successful run
    Status(commands::status::StatusArgs),
    /// Queue diagnostics and maintenance
    Queue(commands::queue::QueueArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag otherwise (defaults to info)
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    // Logs go to stderr so `--json` output stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let source = ConfigSource {
        path: cli.config,
        local_url: cli.local_url,
        remote_url: cli.remote_url,
    };

    match cli.command {
        Commands::Run(args) => commands::run::run(&source, args).await,
        Commands::Hook(args) => commands::run::hook(&source, args).await,
        Commands::Watch(args) => commands::run::watch(&source, args).await,
        Commands::ForceSync(args) => commands::force_sync::command(&source, args).await,
        Commands::InstallTriggers(args) => commands::triggers::install(&source, args).await,
        Commands::Probe(args) => commands::triggers::probe(&source, args).await,
        Commands::Status(args) => commands::status::command(&source, args).await,
        Commands::Queue(args) => commands::queue::command(&source, args).await,
    }
}
