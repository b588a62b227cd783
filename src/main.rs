use std::sync::Arc;

use fleetq::agents::AgentRegistry;
use fleetq::api::{ApiState, api_routes};
use fleetq::config::EngineConfig;
use fleetq::scheduler::ActiveRunners;
use fleetq::{recovery, store};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_env();

    // Initialize tracing
    let default_filter = if config.debug_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    eprintln!("fleetq v{}", env!("CARGO_PKG_VERSION"));

    // A required but unreachable backend is fatal (non-zero exit).
    let store = store::connect(&config).await?;

    // Re-normalize queues interrupted by a previous crash.
    recovery::run(store.as_ref()).await?;

    let agents = match &config.agents_path {
        Some(path) => {
            let registry = AgentRegistry::from_file(path)?;
            info!(count = registry.len(), roster = %path.display(), "Agent roster loaded");
            Arc::new(registry)
        }
        None => {
            info!("No agent roster configured (FLEETQ_AGENTS); dispatches will fail agent lookup");
            Arc::new(AgentRegistry::default())
        }
    };

    let runners = Arc::new(ActiveRunners::new());
    let state = ApiState {
        store,
        agents,
        runners: Arc::clone(&runners),
        config: config.clone(),
        client: reqwest::Client::new(),
    };
    let app = api_routes(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, store = ?config.store_endpoint, "Control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(runners))
        .await?;
    Ok(())
}

async fn shutdown_signal(runners: Arc<ActiveRunners>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested, stopping active runners");
        runners.stop_all();
    }
}
