use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hypha::config::AppConfig;
use hypha::server::{create_router, AppState};
use hypha::shutdown::{graceful_shutdown, wait_for_shutdown};
use hypha::workflow::monitor::spawn_monitor;

#[derive(Parser)]
#[command(name = "hypha", about = "Issue-to-pull-request workflow orchestrator")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = AppConfig::load(cli.config.as_deref())?;

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        retry_attempts = config.orchestrator.retry_attempts,
        max_workflow_time_ms = config.orchestrator.max_workflow_time_ms,
        "Starting Hypha orchestrator"
    );

    let state = Arc::new(AppState::new(config.clone())?);

    let monitor = spawn_monitor(
        Arc::clone(&state.orchestrator),
        config.orchestrator.monitor_interval(),
    );

    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    ))
    .await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    graceful_shutdown(&state, monitor).await;

    Ok(())
}
