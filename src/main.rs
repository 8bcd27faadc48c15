//! PingMeDaddy - Network Telemetry Service
//!
//! Continuously probes a fleet of IP targets and serves windowed latency and
//! packet-loss analytics over an authenticated HTTP API.

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pingmedaddy::cli::{self, Command};
use pingmedaddy::config::Settings;
use pingmedaddy::db::Store;
use pingmedaddy::registry::Registry;
use pingmedaddy::scheduler::Scheduler;
use pingmedaddy::web::Server;

#[derive(Debug, Parser)]
#[command(name = "pingmedaddy")]
#[command(about = "Continuous ping telemetry with windowed analytics", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Print CLI output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pingmedaddy=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        other => cli::run(other, &settings, args.json).await,
    }
}

async fn serve(settings: Settings) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = Arc::new(settings);
    tracing::info!("Starting PingMeDaddy on port {}...", settings.app_port);
    tracing::info!("Using database at {}", settings.db_path());

    let store = Arc::new(Store::new(settings.db_path())?);
    tracing::info!("Database initialized successfully");

    // Probe loops for boot-time targets run before the listener binds.
    let scheduler = Arc::new(Scheduler::new(store.clone(), &settings));
    scheduler.start().await?;

    let registry = Arc::new(Registry::new(store.clone(), scheduler.clone()));

    let server = Server::new(settings, store, registry);
    server
        .start(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
