use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use fil_bus::{topics, EventBus, EventFilter};
use fil_core::error::StoreError;
use fil_core::types::{
    BeadTemplate, BeadType, BusEvent, MotivationRule, RuleType, TriggerRecord,
};
use fil_harness::{CircuitBreaker, CircuitBreakerConfig};
use fil_store::{BeadFilter, BeadStore, NewBead};

use crate::agents::{AgentManager, AgentSignal};
use crate::idle::IdleDetector;

/// Trigger records retained for `history()`.
const HISTORY_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Metric sources
// ---------------------------------------------------------------------------

/// Integer metric backing a threshold rule. Conditions are opaque keys;
/// a rule whose key has no registered source logs and never fires.
#[async_trait::async_trait]
pub trait MetricSource: Send + Sync {
    async fn value(&self, project_id: Option<Uuid>) -> i64;
}

/// Built-in `open-bead-count` metric.
struct OpenBeadCount {
    store: Arc<BeadStore>,
}

#[async_trait::async_trait]
impl MetricSource for OpenBeadCount {
    async fn value(&self, project_id: Option<Uuid>) -> i64 {
        let filter = BeadFilter {
            project_id,
            status: Some(fil_core::types::BeadStatus::Open),
            ..Default::default()
        };
        self.store.list(&filter).await.len() as i64
    }
}

// ---------------------------------------------------------------------------
// Rule requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub rule_type: RuleType,
    pub condition: String,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub cooldown_secs: u64,
    pub priority: u8,
    pub create_bead: Option<BeadTemplate>,
    pub wake_agent: Option<Uuid>,
    pub project_id: Option<Uuid>,
}

impl NewRule {
    pub fn new(name: impl Into<String>, rule_type: RuleType, condition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rule_type,
            condition: condition.into(),
            params: serde_json::Map::new(),
            cooldown_secs: 300,
            priority: 2,
            create_bead: None,
            wake_agent: None,
            project_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub name: Option<String>,
    pub condition: Option<String>,
    pub params: Option<serde_json::Map<String, serde_json::Value>>,
    pub cooldown_secs: Option<u64>,
    pub priority: Option<u8>,
    /// `Some(None)` clears the template.
    pub create_bead: Option<Option<BeadTemplate>>,
    pub wake_agent: Option<Option<Uuid>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub rule_type: Option<RuleType>,
    pub enabled: Option<bool>,
    pub project_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// MotivationEngine
// ---------------------------------------------------------------------------

/// Turns time/event/idle/threshold triggers into beads and agent wake-ups.
///
/// Rule effects are best-effort: failures are recorded in the trigger
/// record and logged, and never suppress the next fire. The auto-bug-filing
/// path (bug templates) runs through a circuit breaker so a broken
/// downstream fails fast instead of hammering the store.
pub struct MotivationEngine {
    rules: RwLock<HashMap<Uuid, MotivationRule>>,
    history: Mutex<VecDeque<TriggerRecord>>,
    metrics: StdRwLock<HashMap<String, Arc<dyn MetricSource>>>,
    store: Arc<BeadStore>,
    agents: Arc<AgentManager>,
    idle: Arc<IdleDetector>,
    bus: EventBus,
    breaker: CircuitBreaker,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl MotivationEngine {
    pub fn new(
        store: Arc<BeadStore>,
        agents: Arc<AgentManager>,
        idle: Arc<IdleDetector>,
        bus: EventBus,
    ) -> Self {
        let (shutdown, _) = tokio::sync::watch::channel(false);
        let engine = Self {
            rules: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            metrics: StdRwLock::new(HashMap::new()),
            store: Arc::clone(&store),
            agents,
            idle,
            bus,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            shutdown,
        };
        engine.register_metric("open-bead-count", Arc::new(OpenBeadCount { store }));
        engine
    }

    /// Register a metric source for threshold conditions.
    pub fn register_metric(&self, key: impl Into<String>, source: Arc<dyn MetricSource>) {
        self.metrics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), source);
    }

    // ----- rule CRUD -------------------------------------------------------

    pub async fn register(&self, new: NewRule) -> MotivationRule {
        self.register_inner(new, false).await
    }

    async fn register_inner(&self, new: NewRule, built_in: bool) -> MotivationRule {
        let now = Utc::now();
        let rule = MotivationRule {
            id: Uuid::new_v4(),
            name: new.name,
            rule_type: new.rule_type,
            condition: new.condition,
            params: new.params,
            cooldown_secs: new.cooldown_secs,
            priority: new.priority,
            create_bead: new.create_bead,
            wake_agent: new.wake_agent,
            project_id: new.project_id,
            last_triggered_at: None,
            next_trigger_at: (new.rule_type == RuleType::Scheduled)
                .then(|| now + chrono::Duration::seconds(new.cooldown_secs as i64)),
            trigger_count: 0,
            enabled: true,
            built_in,
            created_at: now,
            updated_at: now,
        };
        tracing::info!(rule_id = %rule.id, name = %rule.name, rule_type = ?rule.rule_type, "motivation rule registered");
        self.rules.write().await.insert(rule.id, rule.clone());
        rule
    }

    pub async fn get(&self, id: Uuid) -> Result<MotivationRule, StoreError> {
        self.rules
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::RuleNotFound(id))
    }

    pub async fn update(&self, id: Uuid, patch: RulePatch) -> Result<MotivationRule, StoreError> {
        let mut rules = self.rules.write().await;
        let rule = rules.get_mut(&id).ok_or(StoreError::RuleNotFound(id))?;
        if let Some(name) = patch.name {
            rule.name = name;
        }
        if let Some(condition) = patch.condition {
            rule.condition = condition;
        }
        if let Some(params) = patch.params {
            rule.params = params;
        }
        if let Some(cooldown_secs) = patch.cooldown_secs {
            rule.cooldown_secs = cooldown_secs;
        }
        if let Some(priority) = patch.priority {
            rule.priority = priority;
        }
        if let Some(create_bead) = patch.create_bead {
            rule.create_bead = create_bead;
        }
        if let Some(wake_agent) = patch.wake_agent {
            rule.wake_agent = wake_agent;
        }
        if let Some(enabled) = patch.enabled {
            rule.enabled = enabled;
        }
        rule.updated_at = Utc::now();
        Ok(rule.clone())
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let mut rules = self.rules.write().await;
        let rule = rules.get_mut(&id).ok_or(StoreError::RuleNotFound(id))?;
        rule.enabled = enabled;
        rule.updated_at = Utc::now();
        Ok(())
    }

    /// Built-in rules may be disabled but never deleted.
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rules = self.rules.write().await;
        let rule = rules.get(&id).ok_or(StoreError::RuleNotFound(id))?;
        if rule.built_in {
            return Err(StoreError::InvalidArgument(
                "built-in rules cannot be deleted".into(),
            ));
        }
        rules.remove(&id);
        Ok(())
    }

    pub async fn list(&self, filter: &RuleFilter) -> Vec<MotivationRule> {
        let mut out: Vec<MotivationRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| filter.rule_type.is_none_or(|t| r.rule_type == t))
            .filter(|r| filter.enabled.is_none_or(|e| r.enabled == e))
            .filter(|r| filter.project_id.is_none_or(|p| r.project_id == Some(p)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        out
    }

    /// Re-install rules from an import, preserving ids, built-in flags and
    /// trigger bookkeeping. Ids already registered are left untouched.
    /// Returns how many rules were installed.
    pub async fn reseed(&self, rules: Vec<MotivationRule>) -> usize {
        let mut table = self.rules.write().await;
        let mut installed = 0;
        for rule in rules {
            if table.contains_key(&rule.id) {
                continue;
            }
            tracing::debug!(rule_id = %rule.id, name = %rule.name, "motivation rule reseeded from import");
            table.insert(rule.id, rule);
            installed += 1;
        }
        installed
    }

    /// Drop every rule, built-ins included. Used by replace imports before
    /// reseeding from the document (which carries the built-ins too).
    pub async fn clear_all(&self) {
        self.rules.write().await.clear();
    }

    /// Most recent trigger records, newest first.
    pub fn history(&self, limit: usize) -> Vec<TriggerRecord> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    // ----- seeding ---------------------------------------------------------

    /// Install the built-in rule set. Idempotent by rule name.
    pub async fn seed_builtins(&self) {
        let existing: Vec<String> = self
            .rules
            .read()
            .await
            .values()
            .map(|r| r.name.clone())
            .collect();

        if !existing.iter().any(|n| n == "backlog-pressure") {
            let mut rule = NewRule::new("backlog-pressure", RuleType::Threshold, "open-bead-count");
            rule.params
                .insert("threshold".into(), serde_json::json!(25));
            rule.cooldown_secs = 6 * 3600;
            rule.create_bead = Some(BeadTemplate {
                title: "Triage the backlog".into(),
                description: Some("Open bead count crossed the pressure threshold.".into()),
                bead_type: BeadType::Chore,
                priority: 1,
                tags: ["triage".to_string()].into_iter().collect(),
                context: Default::default(),
            });
            self.register_inner(rule, true).await;
        }

        if !existing.iter().any(|n| n == "repeated-failure-filing") {
            let mut rule = NewRule::new(
                "repeated-failure-filing",
                RuleType::Event,
                topics::BEAD_FAILED,
            );
            rule.cooldown_secs = 300;
            rule.create_bead = Some(BeadTemplate {
                title: "Investigate bead failure".into(),
                description: Some("A bead release reported failure; file and triage.".into()),
                bead_type: BeadType::Bug,
                priority: 1,
                tags: ["auto-filed".to_string()].into_iter().collect(),
                context: Default::default(),
            });
            self.register_inner(rule, true).await;
        }

        if !existing.iter().any(|n| n == "idle-project-sweep") {
            let mut rule = NewRule::new("idle-project-sweep", RuleType::Idle, "project-idle");
            rule.params
                .insert("idle_for_secs".into(), serde_json::json!(1800));
            rule.cooldown_secs = 3600;
            self.register_inner(rule, true).await;
        }
    }

    // ----- evaluation ------------------------------------------------------

    fn cooled_down(rule: &MotivationRule) -> bool {
        match rule.last_triggered_at {
            Some(last) => {
                last + chrono::Duration::seconds(rule.cooldown_secs as i64) <= Utc::now()
            }
            None => true,
        }
    }

    /// One pass over scheduled / idle / threshold rules.
    pub async fn tick(&self) {
        let now = Utc::now();
        let candidates: Vec<MotivationRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.enabled && r.rule_type != RuleType::Event)
            .cloned()
            .collect();

        for rule in candidates {
            let due = match rule.rule_type {
                RuleType::Scheduled => rule.next_trigger_at.map(|t| now >= t).unwrap_or(true),
                RuleType::Idle => {
                    let Some(project_id) = rule.project_id else {
                        continue;
                    };
                    let idle_for = rule
                        .params
                        .get("idle_for_secs")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(1800);
                    Self::cooled_down(&rule)
                        && self.idle.is_idle(project_id, Duration::from_secs(idle_for))
                }
                RuleType::Threshold => {
                    let source = {
                        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
                        metrics.get(&rule.condition).cloned()
                    };
                    let Some(source) = source else {
                        tracing::warn!(rule = %rule.name, condition = %rule.condition, "no evaluator for condition");
                        continue;
                    };
                    let threshold = rule
                        .params
                        .get("threshold")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(i64::MAX);
                    Self::cooled_down(&rule)
                        && source.value(rule.project_id).await > threshold
                }
                RuleType::Event => false,
            };
            if due {
                self.fire(rule.id, None).await;
            }
        }
    }

    /// Deliver a bus event to matching event rules.
    async fn on_event(&self, event: &BusEvent) {
        let candidates: Vec<MotivationRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.enabled && r.rule_type == RuleType::Event)
            .filter(|r| event.event_type.starts_with(r.condition.as_str()))
            .filter(|r| r.project_id.is_none() || r.project_id == event.project_id)
            .filter(|r| Self::cooled_down(r))
            .cloned()
            .collect();
        for rule in candidates {
            self.fire(rule.id, event.project_id).await;
        }
    }

    /// Fire a rule: run its effects, stamp cooldown bookkeeping, record a
    /// trigger record. Manual triggers come through here too.
    pub async fn fire(&self, rule_id: Uuid, event_project: Option<Uuid>) -> Option<TriggerRecord> {
        let rule = {
            let rules = self.rules.read().await;
            rules.get(&rule_id).cloned()
        }?;

        let now = Utc::now();
        let mut record = TriggerRecord {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            fired_at: now,
            created_bead_id: None,
            woke_agent_id: None,
            errors: Vec::new(),
        };

        if let Some(ref template) = rule.create_bead {
            match rule.project_id.or(event_project) {
                Some(project_id) => {
                    match self.create_from_template(template, project_id).await {
                        Ok(bead_id) => record.created_bead_id = Some(bead_id),
                        Err(e) => {
                            tracing::warn!(rule = %rule.name, error = %e, "bead creation effect failed");
                            record.errors.push(e);
                        }
                    }
                }
                None => record
                    .errors
                    .push("no project to create the bead in".to_string()),
            }
        }

        if let Some(agent_id) = rule.wake_agent {
            match self.agents.send_signal(agent_id, AgentSignal::Wake) {
                Ok(()) => record.woke_agent_id = Some(agent_id),
                Err(e) => {
                    tracing::warn!(rule = %rule.name, agent_id = %agent_id, error = %e, "wake effect failed");
                    record.errors.push(e.to_string());
                }
            }
        }

        {
            let mut rules = self.rules.write().await;
            if let Some(rule) = rules.get_mut(&rule_id) {
                rule.last_triggered_at = Some(now);
                rule.trigger_count += 1;
                if rule.rule_type == RuleType::Scheduled {
                    rule.next_trigger_at =
                        Some(now + chrono::Duration::seconds(rule.cooldown_secs as i64));
                }
                rule.updated_at = now;
            }
        }

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        tracing::info!(rule = %record.rule_name, errors = record.errors.len(), "motivation rule fired");
        let mut event = BusEvent::new(topics::MOTIVATION_TRIGGERED, "motivation_engine")
            .with_data("rule_id", serde_json::json!(rule.id))
            .with_data("rule_name", serde_json::json!(rule.name));
        if let Some(project_id) = rule.project_id.or(event_project) {
            event = event.with_project(project_id);
        }
        self.bus.publish(event);

        Some(record)
    }

    /// Bug templates go through the circuit breaker: after repeated
    /// downstream failures the auto-file path fails fast for a cooldown.
    async fn create_from_template(
        &self,
        template: &BeadTemplate,
        project_id: Uuid,
    ) -> Result<Uuid, String> {
        let mut new = NewBead::new(template.title.clone(), template.bead_type, project_id);
        new.description = template.description.clone();
        new.priority = template.priority;
        new.tags = template.tags.clone();
        new.context = template.context.clone();

        if template.bead_type == BeadType::Bug {
            let store = Arc::clone(&self.store);
            self.breaker
                .call(move || async move { store.create(new).await })
                .await
                .map(|bead| bead.id)
                .map_err(|e| e.to_string())
        } else {
            self.store
                .create(new)
                .await
                .map(|bead| bead.id)
                .map_err(|e| e.to_string())
        }
    }

    // ----- runtime ---------------------------------------------------------

    /// Spawn the periodic evaluator and the event-rule listener.
    pub fn start(self: &Arc<Self>, tick_interval: Duration) {
        {
            let engine = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(tick_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => engine.tick().await,
                    }
                }
            });
        }
        {
            let engine = Arc::clone(self);
            let subscription = self.bus.subscribe(EventFilter::all());
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = subscription.receiver.recv_async() => {
                            let Ok(event) = event else { break };
                            // Ignore our own publications.
                            if event.event_type == topics::MOTIVATION_TRIGGERED {
                                continue;
                            }
                            engine.on_event(&event).await;
                        }
                    }
                }
            });
        }
        tracing::info!("motivation engine started");
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fil_harness::{MockProvider, ProviderConfig, ProviderKind, ProviderRegistry, SecretStore};
    use fil_store::{ClaimCoordinator, ConversationStore, DecisionManager, FileLockManager};

    struct Fixture {
        store: Arc<BeadStore>,
        agents: Arc<AgentManager>,
        idle: Arc<IdleDetector>,
        engine: Arc<MotivationEngine>,
        bus: EventBus,
        project: Uuid,
    }

    async fn fixture() -> Fixture {
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
            Arc::new(MockProvider::new("mock")),
        );
        let agents = Arc::new(AgentManager::new(
            locks,
            coordinator,
            conversations,
            registry,
            bus.clone(),
        ));
        let idle = Arc::new(IdleDetector::new());
        let project = store.create_project("demo").await;
        let engine = Arc::new(MotivationEngine::new(
            Arc::clone(&store),
            Arc::clone(&agents),
            Arc::clone(&idle),
            bus.clone(),
        ));
        Fixture {
            store,
            agents,
            idle,
            engine,
            bus,
            project: project.id,
        }
    }

    fn chore_template() -> BeadTemplate {
        BeadTemplate {
            title: "sweep".into(),
            description: None,
            bead_type: BeadType::Chore,
            priority: 2,
            tags: Default::default(),
            context: Default::default(),
        }
    }

    #[tokio::test]
    async fn scheduled_rule_fires_when_due() {
        let f = fixture().await;
        let mut new = NewRule::new("sweeper", RuleType::Scheduled, "time");
        new.cooldown_secs = 3600;
        new.project_id = Some(f.project);
        new.create_bead = Some(chore_template());
        let rule = f.engine.register(new).await;

        // Not yet due: next_trigger_at is one cooldown out.
        f.engine.tick().await;
        assert_eq!(f.engine.get(rule.id).await.unwrap().trigger_count, 0);

        // Force it due.
        f.engine
            .update(rule.id, RulePatch::default())
            .await
            .unwrap();
        {
            let mut rules = f.engine.rules.write().await;
            rules.get_mut(&rule.id).unwrap().next_trigger_at =
                Some(Utc::now() - chrono::Duration::seconds(1));
        }
        f.engine.tick().await;

        let fired = f.engine.get(rule.id).await.unwrap();
        assert_eq!(fired.trigger_count, 1);
        assert!(fired.next_trigger_at.unwrap() > Utc::now());
        let beads = f
            .store
            .list(&BeadFilter {
                project_id: Some(f.project),
                ..Default::default()
            })
            .await;
        assert_eq!(beads.len(), 1);
        assert_eq!(beads[0].title, "sweep");
    }

    #[tokio::test]
    async fn event_rule_respects_cooldown() {
        let f = fixture().await;
        let mut new = NewRule::new("on-failure", RuleType::Event, topics::BEAD_FAILED);
        new.cooldown_secs = 3600;
        new.project_id = Some(f.project);
        new.create_bead = Some(chore_template());
        let rule = f.engine.register(new).await;

        let event = BusEvent::new(topics::BEAD_FAILED, "test").with_project(f.project);
        f.engine.on_event(&event).await;
        f.engine.on_event(&event).await;

        // Second delivery inside the cooldown window is suppressed.
        assert_eq!(f.engine.get(rule.id).await.unwrap().trigger_count, 1);
    }

    #[tokio::test]
    async fn threshold_rule_uses_registered_metric() {
        let f = fixture().await;
        for i in 0..3 {
            f.store
                .create(NewBead::new(format!("b{i}"), BeadType::Task, f.project))
                .await
                .unwrap();
        }
        let mut new = NewRule::new("pressure", RuleType::Threshold, "open-bead-count");
        new.params.insert("threshold".into(), serde_json::json!(2));
        new.project_id = Some(f.project);
        let rule = f.engine.register(new).await;

        f.engine.tick().await;
        assert_eq!(f.engine.get(rule.id).await.unwrap().trigger_count, 1);
    }

    #[tokio::test]
    async fn threshold_rule_with_unknown_condition_never_fires() {
        let f = fixture().await;
        let mut new = NewRule::new("mystery", RuleType::Threshold, "martian-count");
        new.params.insert("threshold".into(), serde_json::json!(0));
        let rule = f.engine.register(new).await;

        f.engine.tick().await;
        assert_eq!(f.engine.get(rule.id).await.unwrap().trigger_count, 0);
    }

    #[tokio::test]
    async fn idle_rule_fires_for_quiet_project() {
        let f = fixture().await;
        f.idle.touch(f.project);
        let mut new = NewRule::new("idle-sweep", RuleType::Idle, "project-idle");
        new.params
            .insert("idle_for_secs".into(), serde_json::json!(0));
        new.project_id = Some(f.project);
        let rule = f.engine.register(new).await;

        f.engine.tick().await;
        assert_eq!(f.engine.get(rule.id).await.unwrap().trigger_count, 1);
    }

    #[tokio::test]
    async fn wake_effect_reaches_agent_inbox() {
        let f = fixture().await;
        let (agent, rx) = f
            .agents
            .spawn("sleeper", "coder", f.project, "mock", None)
            .await;
        let mut new = NewRule::new("waker", RuleType::Scheduled, "time");
        new.wake_agent = Some(agent.id);
        let rule = f.engine.register(new).await;

        let record = f.engine.fire(rule.id, None).await.unwrap();
        assert_eq!(record.woke_agent_id, Some(agent.id));
        assert_eq!(rx.recv().unwrap(), AgentSignal::Wake);
    }

    #[tokio::test]
    async fn effect_failure_is_recorded_not_fatal() {
        let f = fixture().await;
        let mut new = NewRule::new("broken-wake", RuleType::Scheduled, "time");
        new.wake_agent = Some(Uuid::new_v4());
        let rule = f.engine.register(new).await;

        let record = f.engine.fire(rule.id, None).await.unwrap();
        assert!(record.woke_agent_id.is_none());
        assert_eq!(record.errors.len(), 1);
        // The rule still advanced its bookkeeping.
        assert_eq!(f.engine.get(rule.id).await.unwrap().trigger_count, 1);
    }

    #[tokio::test]
    async fn builtins_seed_once_and_cannot_be_deleted() {
        let f = fixture().await;
        f.engine.seed_builtins().await;
        f.engine.seed_builtins().await;

        let rules = f.engine.list(&RuleFilter::default()).await;
        let builtin_count = rules.iter().filter(|r| r.built_in).count();
        assert_eq!(builtin_count, 3);

        let builtin = rules.iter().find(|r| r.built_in).unwrap();
        let err = f.engine.delete(builtin.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        // Disable is allowed.
        f.engine.set_enabled(builtin.id, false).await.unwrap();
        assert!(!f.engine.get(builtin.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn reseed_preserves_rules_and_skips_existing() {
        let exporter = fixture().await;
        exporter.engine.seed_builtins().await;
        let custom = exporter
            .engine
            .register(NewRule::new("custom", RuleType::Scheduled, "time"))
            .await;
        exporter.engine.fire(custom.id, None).await;
        let snapshot = exporter.engine.list(&RuleFilter::default()).await;

        let importer = fixture().await;
        let installed = importer.engine.reseed(snapshot.clone()).await;
        assert_eq!(installed, snapshot.len());

        // Bookkeeping and built-in flags come through verbatim.
        let restored = importer.engine.get(custom.id).await.unwrap();
        assert_eq!(restored.trigger_count, 1);
        assert!(importer
            .engine
            .list(&RuleFilter::default())
            .await
            .iter()
            .any(|r| r.built_in));

        // Built-in protection still applies to reseeded rules.
        let builtin = snapshot.iter().find(|r| r.built_in).unwrap();
        assert!(importer.engine.delete(builtin.id).await.is_err());

        // A second reseed is a no-op.
        assert_eq!(importer.engine.reseed(snapshot).await, 0);
    }

    #[tokio::test]
    async fn clear_all_removes_builtins_too() {
        let f = fixture().await;
        f.engine.seed_builtins().await;
        f.engine.clear_all().await;
        assert!(f.engine.list(&RuleFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn history_keeps_newest_first() {
        let f = fixture().await;
        let first = f
            .engine
            .register(NewRule::new("one", RuleType::Scheduled, "time"))
            .await;
        let second = f
            .engine
            .register(NewRule::new("two", RuleType::Scheduled, "time"))
            .await;
        f.engine.fire(first.id, None).await;
        f.engine.fire(second.id, None).await;

        let history = f.engine.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].rule_name, "two");
    }

    #[tokio::test]
    async fn fire_publishes_motivation_triggered() {
        let f = fixture().await;
        let sub = f
            .bus
            .subscribe(EventFilter::for_type(topics::MOTIVATION_TRIGGERED));
        let rule = f
            .engine
            .register(NewRule::new("loud", RuleType::Scheduled, "time"))
            .await;
        f.engine.fire(rule.id, None).await;

        let event = sub.receiver.recv().unwrap();
        assert_eq!(event.data["rule_name"], "loud");
    }
}
