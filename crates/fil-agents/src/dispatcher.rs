use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fil_bus::{topics, EventBus, EventFilter};
use fil_core::config::DispatcherConfig;
use fil_core::error::StoreError;
use fil_core::types::{BeadStatus, BeadType, BusEvent};
use fil_store::{BeadFilter, BeadStore, ClaimCoordinator};

use crate::agents::AgentManager;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherStatus {
    Running,
    Paused,
    /// Pause requested while claimed beads are still in flight.
    Draining,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherState {
    pub status: DispatcherStatus,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Matches ready beads to idle compatible agents.
///
/// The dispatcher holds no state beyond indices derivable from the bead
/// store, so it is crash-safe by construction. Bus events coalesce into
/// one pending-reevaluation marker per project through a bounded work
/// channel; a periodic tick sweeps every project to catch dropped markers.
pub struct Dispatcher {
    store: Arc<BeadStore>,
    coordinator: Arc<ClaimCoordinator>,
    agents: Arc<AgentManager>,
    bus: EventBus,
    config: DispatcherConfig,
    control: Mutex<Control>,
    queued: Mutex<HashSet<Uuid>>,
    work_tx: flume::Sender<Uuid>,
    work_rx: flume::Receiver<Uuid>,
    /// bead type -> roles accepted for it; absent entry means any role.
    routing: RwLock<HashMap<BeadType, HashSet<String>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
    /// Spawn agent sessions after a successful claim. Tests turn this off
    /// to observe pure matching behavior.
    run_sessions: bool,
}

struct Control {
    paused: bool,
    reason: Option<String>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<BeadStore>,
        coordinator: Arc<ClaimCoordinator>,
        agents: Arc<AgentManager>,
        bus: EventBus,
        config: DispatcherConfig,
    ) -> Self {
        let (work_tx, work_rx) = flume::bounded(config.work_channel_capacity);
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            store,
            coordinator,
            agents,
            bus,
            config,
            control: Mutex::new(Control {
                paused: false,
                reason: None,
            }),
            queued: Mutex::new(HashSet::new()),
            work_tx,
            work_rx,
            routing: RwLock::new(HashMap::new()),
            shutdown,
            run_sessions: true,
        }
    }

    /// Disable agent-session spawning after claims (test harness).
    pub fn without_sessions(mut self) -> Self {
        self.run_sessions = false;
        self
    }

    /// Restrict a bead type to a set of agent roles. An empty set removes
    /// the restriction (any role accepts the type again).
    pub fn set_routing(&self, bead_type: BeadType, roles: HashSet<String>) {
        let mut routing = self.routing.write().unwrap_or_else(|e| e.into_inner());
        if roles.is_empty() {
            routing.remove(&bead_type);
        } else {
            routing.insert(bead_type, roles);
        }
    }

    fn role_accepts(&self, bead_type: BeadType, role: &str) -> bool {
        let routing = self.routing.read().unwrap_or_else(|e| e.into_inner());
        match routing.get(&bead_type) {
            Some(roles) => roles.contains(role),
            None => true,
        }
    }

    // ----- control ---------------------------------------------------------

    pub async fn status(&self) -> DispatcherState {
        let (paused, reason) = {
            let control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            (control.paused, control.reason.clone())
        };
        if !paused {
            return DispatcherState {
                status: DispatcherStatus::Running,
                reason,
            };
        }
        let status = if self.outstanding().await > 0 {
            DispatcherStatus::Draining
        } else {
            DispatcherStatus::Paused
        };
        DispatcherState { status, reason }
    }

    async fn outstanding(&self) -> usize {
        let claimed = self
            .store
            .list(&BeadFilter {
                status: Some(BeadStatus::Claimed),
                ..Default::default()
            })
            .await
            .len();
        let in_progress = self
            .store
            .list(&BeadFilter {
                status: Some(BeadStatus::InProgress),
                ..Default::default()
            })
            .await
            .len();
        claimed + in_progress
    }

    /// Halt new claims. In-flight sessions finish; status reads
    /// `draining` until they do.
    pub fn pause(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            control.paused = true;
            control.reason = Some(reason.clone());
        }
        tracing::info!(reason = %reason, "dispatcher paused");
        self.bus.publish(
            BusEvent::new(topics::DISPATCHER_PAUSED, "dispatcher")
                .with_data("reason", serde_json::json!(reason)),
        );
    }

    pub async fn resume(&self) {
        {
            let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            control.paused = false;
            control.reason = None;
        }
        tracing::info!("dispatcher resumed");
        self.bus
            .publish(BusEvent::new(topics::DISPATCHER_RESUMED, "dispatcher"));
        self.sweep_all().await;
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    // ----- scheduling ------------------------------------------------------

    /// Coalesce a reevaluation request for one project. Duplicate markers
    /// and channel overflow are dropped; the periodic sweep catches up.
    pub fn enqueue(&self, project_id: Uuid) {
        let fresh = {
            let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
            queued.insert(project_id)
        };
        if !fresh {
            return;
        }
        if self.work_tx.try_send(project_id).is_err() {
            let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
            queued.remove(&project_id);
        }
    }

    async fn sweep_all(&self) {
        for project in self.store.list_projects().await {
            self.enqueue(project.id);
        }
    }

    /// Spawn the bus listener, the worker loop, and the periodic sweep.
    pub fn start(self: &Arc<Self>) {
        let relevant: HashSet<&'static str> = [
            topics::BEAD_CREATED,
            topics::BEAD_UPDATED,
            topics::BEAD_COMPLETED,
            topics::BEAD_REDISPATCHED,
            topics::AGENT_IDLE,
            topics::AGENT_SPAWNED,
            topics::DECISION_RESOLVED,
            topics::CONFIG_UPDATED,
        ]
        .into_iter()
        .collect();

        // Bus listener: translate relevant events into project markers.
        {
            let dispatcher = Arc::clone(self);
            let subscription = self.bus.subscribe(EventFilter::all());
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = subscription.receiver.recv_async() => {
                            let Ok(event) = event else { break };
                            if !relevant.contains(event.event_type.as_str()) {
                                continue;
                            }
                            if let Some(project_id) = event.project_id {
                                dispatcher.enqueue(project_id);
                            }
                        }
                    }
                }
            });
        }

        // Worker: drain markers and evaluate.
        {
            let dispatcher = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        marker = dispatcher.work_rx.recv_async() => {
                            let Ok(project_id) = marker else { break };
                            {
                                let mut queued = dispatcher
                                    .queued
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner());
                                queued.remove(&project_id);
                            }
                            if let Err(e) = dispatcher.evaluate_project(project_id).await {
                                tracing::warn!(project_id = %project_id, error = %e, "dispatch evaluation failed");
                            }
                        }
                    }
                }
            });
        }

        // Periodic sweep: catch markers dropped under backpressure.
        {
            let dispatcher = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            let period = Duration::from_secs(self.config.tick_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => dispatcher.sweep_all().await,
                    }
                }
            });
        }

        tracing::info!("dispatcher started");
    }

    /// One scheduling tick for a project: pair ready beads with idle
    /// compatible agents and claim.
    ///
    /// Beads come pre-ordered (priority asc, created asc); agents are
    /// least-recently-active first. A lost claim race just moves on to
    /// the next pair within the same tick.
    pub async fn evaluate_project(self: &Arc<Self>, project_id: Uuid) -> Result<usize, StoreError> {
        {
            let control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            if control.paused {
                return Ok(0);
            }
        }

        let ready = self.store.ready_set(project_id).await?;
        if ready.is_empty() {
            return Ok(0);
        }
        let mut idle = self.agents.claimable_for(project_id).await;
        let mut dispatched = 0;

        for bead in ready {
            if idle.is_empty() {
                break;
            }
            let Some(position) = idle
                .iter()
                .position(|agent| self.role_accepts(bead.bead_type, &agent.role))
            else {
                continue;
            };
            let agent = idle.remove(position);

            match self.coordinator.claim(bead.id, agent.id).await {
                Ok(_) => {
                    self.agents.mark_working(agent.id, bead.id).await?;
                    dispatched += 1;
                    tracing::debug!(bead_id = %bead.id, agent_id = %agent.id, "dispatched");
                    if self.run_sessions {
                        let agents = Arc::clone(&self.agents);
                        let (agent_id, bead_id) = (agent.id, bead.id);
                        tokio::spawn(async move {
                            if let Err(e) = agents.run_bead_session(agent_id, bead_id).await {
                                tracing::warn!(agent_id = %agent_id, bead_id = %bead_id, error = %e, "agent session failed");
                            }
                        });
                    }
                }
                Err(StoreError::AlreadyClaimed(_)) | Err(StoreError::NotReady(_, _)) => {
                    // Lost the race (or state moved); the agent stays
                    // available for the next bead in this tick.
                    idle.insert(0, agent);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dispatched)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
