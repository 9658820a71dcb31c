use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use prometheus::Registry;
use tracing::{info, Level};

use mq_lease_server::clock::SystemClock;
use mq_lease_server::config;
use mq_lease_server::lease::{Orchestrator, ProviderState};
use mq_lease_server::metrics::LeaseMetrics;
use mq_lease_server::server;
use mq_lease_server::storage::{SqliteStorage, Storage};
use mq_lease_server::AppState;

#[derive(Parser, Debug)]
#[command(name = "mq-lease-server")]
#[command(about = "Merge queue lease coordination service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Starts the lease server
    Server(ServerArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Server listening port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Configuration path
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,

    /// Persistent state directory
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Enable debug logging
    #[arg(long, default_value_t = false)]
    log_debug: bool,

    /// Enable JSON format logging
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => run_server(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    init_tracing(args.log_debug, args.log_json);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting merge queue lease server"
    );

    let config =
        config::load_server_config(&args.config).context("failed to load configuration")?;

    std::fs::create_dir_all(&args.data)
        .with_context(|| format!("failed to create state directory {:?}", args.data))?;
    let storage = Arc::new(SqliteStorage::new(args.data.join("state.db")));
    Storage::<ProviderState>::init(&*storage)
        .await
        .context("failed to init storage")?;

    let registry = Arc::new(Registry::new());
    let lease_metrics =
        LeaseMetrics::new(&registry).context("failed to register lease metrics")?;

    let orchestrator = Arc::new(Orchestrator::new(
        &config.repositories,
        Arc::new(SystemClock),
        storage.clone(),
        Some(lease_metrics),
    ));
    // A state blob we cannot read is a fatal startup error; running with a
    // silently empty queue could elect a second winner.
    orchestrator
        .hydrate_from_state()
        .await
        .context("failed to hydrate providers from stored state")?;
    info!(providers = orchestrator.get_all().len(), "lease providers ready");

    let basic_auth_users = config
        .auth
        .and_then(|auth| auth.basic)
        .map(|basic| basic.users);

    let app_state = Arc::new(AppState {
        orchestrator,
        storage: storage.clone(),
        registry,
        basic_auth_users,
    });

    let app = server::build_router(app_state);
    server::serve(app, args.port).await?;

    Storage::<ProviderState>::close(&*storage)
        .await
        .context("failed to close storage")?;
    info!("storage closed");
    Ok(())
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    if json {
        tracing_subscriber::fmt().json().with_max_level(level).init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }
}
