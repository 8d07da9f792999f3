//! filament daemon — composes the stores, engines and HTTP bridge, then
//! serves until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use fil_agents::{AgentManager, Dispatcher, IdleDetector, MotivationEngine};
use fil_bridge::{api_router, ApiState};
use fil_bus::{EventBus, LogHandler};
use fil_core::config::Config;
use fil_harness::{ProviderConfig, ProviderRegistry, Secret, SecretStore};
use fil_store::{BeadStore, ClaimCoordinator, ConversationStore, DecisionManager, FileLockManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Load config first so logging honours its level settings.
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(path).context("failed to load config file")?,
        None => Config::load().context("failed to load config")?,
    };

    fil_telemetry::logging::init_from_config("filament-daemon", &config.general);

    tracing::info!(
        instance = %config.general.instance_name,
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "filament daemon starting"
    );

    // ---- shared infrastructure -------------------------------------------
    let bus = EventBus::new(config.bus.subscriber_buffer, config.bus.history_size);
    let log_handler = LogHandler::default();

    // ---- stores -----------------------------------------------------------
    let store = Arc::new(BeadStore::new(bus.clone()));
    let decisions = Arc::new(DecisionManager::new(bus.clone()));
    let coordinator = Arc::new(ClaimCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&decisions),
        bus.clone(),
    ));
    let conversations = Arc::new(ConversationStore::new());
    let locks = Arc::new(FileLockManager::new(bus.clone()));

    // ---- providers --------------------------------------------------------
    let secrets = Arc::new(SecretStore::new());
    let registry = Arc::new(ProviderRegistry::new(Arc::clone(&secrets)));
    for entry in &config.providers {
        let secret = entry
            .secret_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
            .map(Secret::new);
        let kind = entry
            .kind
            .parse()
            .with_context(|| format!("provider {} has a bad kind", entry.id))?;
        let provider_config = ProviderConfig {
            id: entry.id.clone(),
            name: entry.name.clone(),
            kind,
            endpoint: entry.endpoint.clone(),
            model: entry.model.clone(),
            secret_ref: None,
        };
        if let Err(e) = registry.register(provider_config, secret) {
            tracing::warn!(provider_id = %entry.id, error = %e, "provider registration skipped");
        }
    }

    // ---- engines ----------------------------------------------------------
    let agents = Arc::new(AgentManager::new(
        Arc::clone(&locks),
        Arc::clone(&coordinator),
        Arc::clone(&conversations),
        Arc::clone(&registry),
        bus.clone(),
    ));
    let idle = Arc::new(IdleDetector::new());
    idle.start(&bus);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&coordinator),
        Arc::clone(&agents),
        bus.clone(),
        config.dispatcher.clone(),
    ));
    dispatcher.start();

    let motivation = Arc::new(MotivationEngine::new(
        Arc::clone(&store),
        Arc::clone(&agents),
        Arc::clone(&idle),
        bus.clone(),
    ));
    motivation.seed_builtins().await;
    motivation.start(Duration::from_secs(config.dispatcher.tick_interval_secs.max(1)));

    // ---- HTTP bridge ------------------------------------------------------
    // Global state is fully initialized before any handler accepts traffic.
    let state = Arc::new(ApiState::new(
        bus,
        store,
        coordinator,
        decisions,
        conversations,
        locks,
        registry,
        Arc::clone(&agents),
        Arc::clone(&dispatcher),
        Arc::clone(&motivation),
        idle,
        log_handler,
        config.clone(),
    ));
    let app = api_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bridge.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bridge.bind_addr))?;
    tracing::info!(addr = %config.bridge.bind_addr, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Stop claiming first, then the rule engine, so subscribers drain.
    dispatcher.stop();
    motivation.stop();
    tracing::info!("filament daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to listen for ctrl-c, shutting down");
    }
    tracing::info!("shutdown signal received");
}
