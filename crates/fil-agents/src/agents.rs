use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use fil_bus::{topics, EventBus};
use fil_core::error::StoreError;
use fil_core::types::{Agent, AgentStatus, BusEvent, MessageRole, Persona};
use fil_harness::{ChatMessage, ChatRequest, ProviderError, ProviderRegistry};
use fil_store::{
    apply_token_limits, ClaimCoordinator, ConversationStore, FileLockManager, ReleaseOutcome,
};

/// Capacity of each agent inbox; wake signals beyond this are dropped
/// (the agent is clearly awake enough).
const INBOX_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Messages deliverable to an agent's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSignal {
    /// Nudge from the motivation engine or an operator.
    Wake,
    /// Free-form note (e.g. from a decision resolution).
    Message(String),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("agent {0} is not available")]
    AgentUnavailable(Uuid),
}

// ---------------------------------------------------------------------------
// AgentManager
// ---------------------------------------------------------------------------

/// Owner of agent records and their inboxes.
///
/// Maintains the invariant that a `working` agent has exactly the bead it
/// is working on assigned to it; teardown releases every file lock the
/// agent holds and redispatches any in-flight bead.
pub struct AgentManager {
    agents: RwLock<HashMap<Uuid, Agent>>,
    inboxes: DashMap<Uuid, flume::Sender<AgentSignal>>,
    locks: Arc<FileLockManager>,
    coordinator: Arc<ClaimCoordinator>,
    conversations: Arc<ConversationStore>,
    registry: Arc<ProviderRegistry>,
    bus: EventBus,
}

impl AgentManager {
    pub fn new(
        locks: Arc<FileLockManager>,
        coordinator: Arc<ClaimCoordinator>,
        conversations: Arc<ConversationStore>,
        registry: Arc<ProviderRegistry>,
        bus: EventBus,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            inboxes: DashMap::new(),
            locks,
            coordinator,
            conversations,
            registry,
            bus,
        }
    }

    // ----- lifecycle -------------------------------------------------------

    /// Register a new agent and open its inbox. Returns the agent and the
    /// receiving half of the inbox for whoever drives the agent loop.
    pub async fn spawn(
        &self,
        name: impl Into<String>,
        role: impl Into<String>,
        project_id: Uuid,
        provider_id: impl Into<String>,
        persona: Option<Persona>,
    ) -> (Agent, flume::Receiver<AgentSignal>) {
        let mut agent = Agent::new(name, role, project_id, provider_id);
        if let Some(persona) = persona {
            agent.persona = persona;
        }
        let (tx, rx) = flume::bounded(INBOX_CAPACITY);
        self.inboxes.insert(agent.id, tx);
        self.agents.write().await.insert(agent.id, agent.clone());

        tracing::info!(agent_id = %agent.id, name = %agent.name, role = %agent.role, "agent spawned");
        self.bus.publish(
            BusEvent::new(topics::AGENT_SPAWNED, "agent_manager")
                .with_project(project_id)
                .with_data("agent_id", serde_json::json!(agent.id)),
        );
        (agent, rx)
    }

    pub async fn get(&self, id: Uuid) -> Result<Agent, StoreError> {
        self.agents
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::AgentNotFound(id))
    }

    pub async fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by_key(|a| a.created_at);
        agents
    }

    /// Idle agents eligible for beads of `project_id`: home project match
    /// or multi-project, ordered least-recently-active first.
    pub async fn claimable_for(&self, project_id: Uuid) -> Vec<Agent> {
        let mut candidates: Vec<Agent> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.status == AgentStatus::Idle)
            .filter(|a| a.project_id == project_id || a.multi_project)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.last_activity.cmp(&b.last_activity).then(a.id.cmp(&b.id)));
        candidates
    }

    pub async fn set_multi_project(&self, id: Uuid, multi_project: bool) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(&id).ok_or(StoreError::AgentNotFound(id))?;
        agent.multi_project = multi_project;
        Ok(())
    }

    /// Stamp activity (soft swarm presence).
    pub async fn touch(&self, id: Uuid) {
        if let Some(agent) = self.agents.write().await.get_mut(&id) {
            agent.last_activity = Utc::now();
        }
    }

    /// Agents whose last activity is older than `threshold`.
    pub async fn stale(&self, threshold: Duration) -> Vec<Agent> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.status != AgentStatus::Stopped && a.last_activity < cutoff)
            .cloned()
            .collect()
    }

    pub async fn mark_working(&self, id: Uuid, bead_id: Uuid) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(&id).ok_or(StoreError::AgentNotFound(id))?;
        agent.status = AgentStatus::Working;
        agent.current_bead_id = Some(bead_id);
        agent.last_activity = Utc::now();
        Ok(())
    }

    pub async fn mark_idle(&self, id: Uuid) -> Result<(), StoreError> {
        let project_id = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(&id).ok_or(StoreError::AgentNotFound(id))?;
            agent.status = AgentStatus::Idle;
            agent.current_bead_id = None;
            agent.last_activity = Utc::now();
            agent.project_id
        };
        self.bus.publish(
            BusEvent::new(topics::AGENT_IDLE, "agent_manager")
                .with_project(project_id)
                .with_data("agent_id", serde_json::json!(id)),
        );
        Ok(())
    }

    pub async fn pause(&self, id: Uuid) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(&id).ok_or(StoreError::AgentNotFound(id))?;
        agent.status = AgentStatus::Paused;
        Ok(())
    }

    pub async fn resume(&self, id: Uuid) -> Result<(), StoreError> {
        let project_id = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(&id).ok_or(StoreError::AgentNotFound(id))?;
            if agent.status != AgentStatus::Paused {
                return Err(StoreError::InvalidArgument(format!(
                    "agent {id} is not paused"
                )));
            }
            agent.status = AgentStatus::Idle;
            agent.last_activity = Utc::now();
            agent.project_id
        };
        self.bus.publish(
            BusEvent::new(topics::AGENT_IDLE, "agent_manager")
                .with_project(project_id)
                .with_data("agent_id", serde_json::json!(id)),
        );
        Ok(())
    }

    /// Tear an agent down: stop it, release every file lock it holds, and
    /// redispatch its in-flight bead so the work is not stranded.
    pub async fn stop(&self, id: Uuid) -> Result<(), StoreError> {
        let (project_id, current_bead) = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(&id).ok_or(StoreError::AgentNotFound(id))?;
            agent.status = AgentStatus::Stopped;
            let current = agent.current_bead_id.take();
            (agent.project_id, current)
        };

        if let Some((_, tx)) = self.inboxes.remove(&id) {
            let _ = tx.try_send(AgentSignal::Shutdown);
        }
        self.locks.release_by_agent(id);

        if let Some(bead_id) = current_bead {
            if let Err(e) = self
                .coordinator
                .redispatch(bead_id, format!("agent {id} stopped"))
                .await
            {
                tracing::warn!(agent_id = %id, bead_id = %bead_id, error = %e, "redispatch on stop failed");
            }
        }

        tracing::info!(agent_id = %id, "agent stopped");
        self.bus.publish(
            BusEvent::new(topics::AGENT_STOPPED, "agent_manager")
                .with_project(project_id)
                .with_data("agent_id", serde_json::json!(id)),
        );
        Ok(())
    }

    /// Re-install agent records from an import, preserving ids, personas
    /// and presence timestamps. Ids already registered are left untouched;
    /// restored agents that are not stopped get a fresh inbox (its driver
    /// reattaches, if any). Returns how many records were installed.
    pub async fn reseed(&self, agents: Vec<Agent>) -> usize {
        let mut table = self.agents.write().await;
        let mut installed = 0;
        for agent in agents {
            if table.contains_key(&agent.id) {
                continue;
            }
            if agent.status != AgentStatus::Stopped {
                let (tx, _rx) = flume::bounded(INBOX_CAPACITY);
                self.inboxes.insert(agent.id, tx);
            }
            tracing::debug!(agent_id = %agent.id, name = %agent.name, "agent reseeded from import");
            table.insert(agent.id, agent);
            installed += 1;
        }
        installed
    }

    /// Drop every agent record and inbox. Used by replace imports before
    /// reseeding.
    pub async fn clear_all(&self) {
        self.agents.write().await.clear();
        self.inboxes.clear();
    }

    /// Best-effort delivery to an agent inbox. A full inbox drops the
    /// signal; a stopped agent is an error.
    pub fn send_signal(&self, id: Uuid, signal: AgentSignal) -> Result<(), StoreError> {
        let tx = self
            .inboxes
            .get(&id)
            .ok_or(StoreError::AgentNotFound(id))?;
        if let Err(flume::TrySendError::Full(_)) = tx.try_send(signal) {
            tracing::debug!(agent_id = %id, "inbox full, signal dropped");
        }
        Ok(())
    }

    // ----- session ---------------------------------------------------------

    /// Drive one claimed bead through the agent's provider.
    ///
    /// Seeds the bead conversation (persona as the system message, the
    /// bead brief as the first user message), projects it through the
    /// token budget, streams the completion, appends the assistant reply
    /// and releases the claim. A provider failure releases the bead as
    /// failed; the claim never leaks.
    pub async fn run_bead_session(&self, agent_id: Uuid, bead_id: Uuid) -> Result<String, SessionError> {
        let agent = self.get(agent_id).await?;
        if matches!(agent.status, AgentStatus::Stopped | AgentStatus::Paused) {
            return Err(SessionError::AgentUnavailable(agent_id));
        }

        self.coordinator.begin(bead_id, agent_id).await?;
        self.mark_working(agent_id, bead_id).await?;

        let result = self.stream_completion(&agent, bead_id).await;

        match result {
            Ok(reply) => {
                self.coordinator
                    .release(bead_id, agent_id, ReleaseOutcome::Done)
                    .await?;
                self.mark_idle(agent_id).await?;
                Ok(reply)
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, bead_id = %bead_id, error = %e, "session failed, releasing bead");
                if let Err(release_err) = self
                    .coordinator
                    .release(bead_id, agent_id, ReleaseOutcome::Failed)
                    .await
                {
                    tracing::error!(bead_id = %bead_id, error = %release_err, "failed release after session error");
                }
                let _ = self.mark_idle(agent_id).await;
                Err(e)
            }
        }
    }

    async fn stream_completion(&self, agent: &Agent, bead_id: Uuid) -> Result<String, SessionError> {
        let bead = self.coordinator.store().get(bead_id).await?;
        let session = self
            .conversations
            .get_or_create(bead_id, bead.project_id)
            .await;

        if session.messages.is_empty() {
            self.conversations
                .append(
                    session.session_id,
                    MessageRole::System,
                    render_persona(&agent.persona, &agent.role),
                )
                .await?;
            self.conversations
                .append(session.session_id, MessageRole::User, render_brief(&bead))
                .await?;
        }

        let provider = self.registry.get(&agent.provider_id)?;
        let session = self.conversations.get(session.session_id).await?;
        let budgeted = apply_token_limits(&session.messages, &provider.model);
        let messages: Vec<ChatMessage> = budgeted
            .iter()
            .map(|m| ChatMessage::new(m.role, m.content.clone()))
            .collect();

        let mut stream = self
            .registry
            .stream(&agent.provider_id, ChatRequest::new(messages))
            .await?;

        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            reply.push_str(&chunk.delta_content);
        }

        self.conversations
            .append(session.session_id, MessageRole::Assistant, reply.clone())
            .await?;
        Ok(reply)
    }
}

/// Render a persona into the session's system message.
fn render_persona(persona: &Persona, role: &str) -> String {
    let mut out = String::new();
    if persona.character.is_empty() {
        out.push_str(&format!("You are a {role} agent."));
    } else {
        out.push_str(&persona.character);
    }
    if !persona.mission.is_empty() {
        out.push_str("\n\nMission: ");
        out.push_str(&persona.mission);
    }
    if !persona.personality.is_empty() {
        out.push_str("\nPersonality: ");
        out.push_str(&persona.personality);
    }
    if !persona.capabilities.is_empty() {
        out.push_str("\nCapabilities: ");
        out.push_str(&persona.capabilities.join(", "));
    }
    if !persona.instructions.is_empty() {
        out.push_str("\n\n");
        out.push_str(&persona.instructions);
    }
    out
}

/// Render a bead into the opening user message.
fn render_brief(bead: &fil_core::types::Bead) -> String {
    let mut out = format!("Task: {}", bead.title);
    if let Some(ref description) = bead.description {
        out.push_str("\n\n");
        out.push_str(description);
    }
    if !bead.context.is_empty() {
        out.push_str("\n\nContext:");
        for (key, value) in &bead.context {
            out.push_str(&format!("\n- {key}: {value}"));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fil_core::types::{BeadStatus, BeadType};
    use fil_harness::{
        ChatResponse, MockProvider, ProviderConfig, ProviderKind, SecretStore,
    };
    use fil_store::{BeadStore, DecisionManager, NewBead};

    struct Fixture {
        store: Arc<BeadStore>,
        coordinator: Arc<ClaimCoordinator>,
        conversations: Arc<ConversationStore>,
        manager: AgentManager,
        locks: Arc<FileLockManager>,
        project: Uuid,
    }

    async fn fixture(mock: MockProvider) -> Fixture {
        let bus = EventBus::default();
        let store = Arc::new(BeadStore::new(bus.clone()));
        let decisions = Arc::new(DecisionManager::new(bus.clone()));
        let coordinator = Arc::new(ClaimCoordinator::new(
            Arc::clone(&store),
            decisions,
            bus.clone(),
        ));
        let locks = Arc::new(FileLockManager::new(bus.clone()));
        let conversations = Arc::new(ConversationStore::new());
        let registry = Arc::new(ProviderRegistry::new(Arc::new(SecretStore::new())));
        registry.register_with(
            ProviderConfig {
                id: "mock".into(),
                name: "mock".into(),
                kind: ProviderKind::Local,
                endpoint: None,
                model: "mock-model".into(),
                secret_ref: None,
            },
            Arc::new(mock),
        );
        let project = store.create_project("demo").await;
        let manager = AgentManager::new(
            Arc::clone(&locks),
            Arc::clone(&coordinator),
            Arc::clone(&conversations),
            registry,
            bus,
        );
        Fixture {
            store,
            coordinator,
            conversations,
            manager,
            locks,
            project: project.id,
        }
    }

    #[tokio::test]
    async fn spawn_and_claimable_ordering() {
        let f = fixture(MockProvider::new("mock")).await;
        let (first, _rx1) = f
            .manager
            .spawn("alpha", "coder", f.project, "mock", None)
            .await;
        let (second, _rx2) = f
            .manager
            .spawn("beta", "coder", f.project, "mock", None)
            .await;

        // Touch the first agent; the second becomes least-recently-used.
        f.manager.touch(first.id).await;
        let claimable = f.manager.claimable_for(f.project).await;
        assert_eq!(claimable.len(), 2);
        assert_eq!(claimable[0].id, second.id);
    }

    #[tokio::test]
    async fn multi_project_agent_is_claimable_elsewhere() {
        let f = fixture(MockProvider::new("mock")).await;
        let other_project = Uuid::new_v4();
        let (agent, _rx) = f
            .manager
            .spawn("rover", "coder", f.project, "mock", None)
            .await;

        assert!(f.manager.claimable_for(other_project).await.is_empty());
        f.manager.set_multi_project(agent.id, true).await.unwrap();
        assert_eq!(f.manager.claimable_for(other_project).await.len(), 1);
    }

    #[tokio::test]
    async fn session_streams_appends_and_releases_done() {
        let mock = MockProvider::new("mock").with_response(ChatResponse {
            content: "patch applied".into(),
            model: "mock-model".into(),
            input_tokens: 4,
            output_tokens: 2,
            finish_reason: "end_turn".into(),
        });
        let f = fixture(mock).await;
        let (agent, _rx) = f
            .manager
            .spawn("alpha", "coder", f.project, "mock", None)
            .await;
        let bead = f
            .store
            .create(NewBead::new("fix the flake", BeadType::Task, f.project))
            .await
            .unwrap();
        f.coordinator.claim(bead.id, agent.id).await.unwrap();

        let reply = f
            .manager
            .run_bead_session(agent.id, bead.id)
            .await
            .unwrap();
        assert_eq!(reply, "patch applied");

        let done = f.store.get(bead.id).await.unwrap();
        assert_eq!(done.status, BeadStatus::Done);
        assert_eq!(
            f.manager.get(agent.id).await.unwrap().status,
            AgentStatus::Idle
        );

        // Transcript: system + brief + assistant reply.
        let session = f.conversations.get_by_bead(bead.id).await.unwrap();
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[0].role, MessageRole::System);
        assert_eq!(session.messages[2].content, "patch applied");
    }

    #[tokio::test]
    async fn session_provider_failure_releases_failed() {
        let mock = MockProvider::new("mock").with_error(ProviderError::Timeout);
        let f = fixture(mock).await;
        let (agent, _rx) = f
            .manager
            .spawn("alpha", "coder", f.project, "mock", None)
            .await;
        let bead = f
            .store
            .create(NewBead::new("doomed", BeadType::Task, f.project))
            .await
            .unwrap();
        f.coordinator.claim(bead.id, agent.id).await.unwrap();

        let err = f.manager.run_bead_session(agent.id, bead.id).await;
        assert!(err.is_err());

        let bead = f.store.get(bead.id).await.unwrap();
        assert_eq!(bead.status, BeadStatus::Open);
        assert!(bead.assigned_to.is_none());
    }

    #[tokio::test]
    async fn stop_releases_locks_and_redispatches() {
        let f = fixture(MockProvider::new("mock")).await;
        let (agent, rx) = f
            .manager
            .spawn("alpha", "coder", f.project, "mock", None)
            .await;
        let bead = f
            .store
            .create(NewBead::new("held", BeadType::Task, f.project))
            .await
            .unwrap();
        f.coordinator.claim(bead.id, agent.id).await.unwrap();
        f.manager.mark_working(agent.id, bead.id).await.unwrap();
        f.locks
            .acquire(f.project, "src/lib.rs", agent.id, Some(bead.id))
            .unwrap();

        f.manager.stop(agent.id).await.unwrap();

        assert!(f.locks.list(Some(f.project)).is_empty());
        assert_eq!(
            f.store.get(bead.id).await.unwrap().status,
            BeadStatus::Open
        );
        assert_eq!(rx.recv().unwrap(), AgentSignal::Shutdown);
        assert!(f
            .manager
            .send_signal(agent.id, AgentSignal::Wake)
            .is_err());
    }

    #[tokio::test]
    async fn wake_signal_reaches_inbox() {
        let f = fixture(MockProvider::new("mock")).await;
        let (agent, rx) = f
            .manager
            .spawn("alpha", "coder", f.project, "mock", None)
            .await;
        f.manager.send_signal(agent.id, AgentSignal::Wake).unwrap();
        assert_eq!(rx.recv().unwrap(), AgentSignal::Wake);
    }

    #[tokio::test]
    async fn reseed_restores_records_and_inboxes() {
        let exporter = fixture(MockProvider::new("mock")).await;
        let (live, _rx) = exporter
            .manager
            .spawn("live", "coder", exporter.project, "mock", None)
            .await;
        let (stopped, _rx) = exporter
            .manager
            .spawn("gone", "coder", exporter.project, "mock", None)
            .await;
        exporter.manager.stop(stopped.id).await.unwrap();
        let snapshot = exporter.manager.list().await;

        let importer = fixture(MockProvider::new("mock")).await;
        let installed = importer.manager.reseed(snapshot).await;
        assert_eq!(installed, 2);

        // Records survive verbatim, presence timestamps included.
        let restored = importer.manager.get(live.id).await.unwrap();
        assert_eq!(restored.name, "live");
        assert_eq!(restored.last_activity, live.last_activity);

        // Only the non-stopped agent gets an inbox back.
        assert!(importer
            .manager
            .send_signal(live.id, AgentSignal::Wake)
            .is_ok());
        assert!(importer
            .manager
            .send_signal(stopped.id, AgentSignal::Wake)
            .is_err());
    }

    #[tokio::test]
    async fn reseed_skips_existing_ids_and_clear_all_empties() {
        let f = fixture(MockProvider::new("mock")).await;
        let (agent, _rx) = f
            .manager
            .spawn("original", "coder", f.project, "mock", None)
            .await;

        let mut doppelganger = agent.clone();
        doppelganger.name = "impostor".into();
        let installed = f.manager.reseed(vec![doppelganger]).await;
        assert_eq!(installed, 0);
        assert_eq!(f.manager.get(agent.id).await.unwrap().name, "original");

        f.manager.clear_all().await;
        assert!(f.manager.list().await.is_empty());
        assert!(f.manager.send_signal(agent.id, AgentSignal::Wake).is_err());
    }

    #[tokio::test]
    async fn stale_listing_is_observability_only() {
        let f = fixture(MockProvider::new("mock")).await;
        let (agent, _rx) = f
            .manager
            .spawn("quiet", "coder", f.project, "mock", None)
            .await;

        // Fresh agent is not stale against a generous threshold.
        assert!(f.manager.stale(Duration::from_secs(3600)).await.is_empty());
        // Against a zero threshold everything not stopped shows up.
        let stale = f.manager.stale(Duration::ZERO).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, agent.id);

        // Stopped agents drop out of the presence listing.
        f.manager.stop(agent.id).await.unwrap();
        assert!(f.manager.stale(Duration::ZERO).await.is_empty());
    }

    #[test]
    fn persona_rendering_includes_sections() {
        let persona = Persona {
            character: "You are Mosaic, a careful refactoring agent.".into(),
            mission: "keep the build green".into(),
            personality: "terse".into(),
            capabilities: vec!["rust".into(), "ci".into()],
            instructions: "Prefer small diffs.".into(),
        };
        let rendered = render_persona(&persona, "coder");
        assert!(rendered.contains("Mosaic"));
        assert!(rendered.contains("keep the build green"));
        assert!(rendered.contains("rust, ci"));
        assert!(rendered.contains("small diffs"));

        let blank = render_persona(&Persona::default(), "reviewer");
        assert!(blank.contains("reviewer agent"));
    }
}
