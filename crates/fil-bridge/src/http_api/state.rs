use std::sync::Arc;
use std::time::Instant;

use fil_agents::{AgentManager, Dispatcher, IdleDetector, MotivationEngine};
use fil_bus::{EventBus, LogHandler};
use fil_core::config::Config;
use fil_harness::ProviderRegistry;
use fil_store::{BeadStore, ClaimCoordinator, ConversationStore, DecisionManager, FileLockManager};

/// Shared application state for all HTTP handlers.
pub struct ApiState {
    pub bus: EventBus,
    pub store: Arc<BeadStore>,
    pub coordinator: Arc<ClaimCoordinator>,
    pub decisions: Arc<DecisionManager>,
    pub conversations: Arc<ConversationStore>,
    pub locks: Arc<FileLockManager>,
    pub registry: Arc<ProviderRegistry>,
    pub agents: Arc<AgentManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub motivation: Arc<MotivationEngine>,
    pub idle: Arc<IdleDetector>,
    pub log_handler: LogHandler,
    pub config: Config,
    /// When set, export/import and other admin mutations require the
    /// matching `x-admin-token` header.
    pub admin_token: Option<String>,
    /// Default provider for `/chat/completions` when the request names none.
    pub default_provider: Option<String>,
    pub start_time: Instant,
}

impl ApiState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        store: Arc<BeadStore>,
        coordinator: Arc<ClaimCoordinator>,
        decisions: Arc<DecisionManager>,
        conversations: Arc<ConversationStore>,
        locks: Arc<FileLockManager>,
        registry: Arc<ProviderRegistry>,
        agents: Arc<AgentManager>,
        dispatcher: Arc<Dispatcher>,
        motivation: Arc<MotivationEngine>,
        idle: Arc<IdleDetector>,
        log_handler: LogHandler,
        config: Config,
    ) -> Self {
        let default_provider = config.providers.first().map(|p| p.id.clone());
        let admin_token = std::env::var("FILAMENT_ADMIN_TOKEN").ok().filter(|t| !t.is_empty());
        Self {
            bus,
            store,
            coordinator,
            decisions,
            conversations,
            locks,
            registry,
            agents,
            dispatcher,
            motivation,
            idle,
            log_handler,
            config,
            admin_token,
            default_provider,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
