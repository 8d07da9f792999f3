use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use fil_bus::{topics, EventBus};
use fil_core::error::StoreError;
use fil_core::types::{
    Bead, BeadStatus, BeadType, BranchAction, BusEvent, Decision, DecisionOption, DecisionStatus,
    ProjectStatus,
};

use crate::beads::{settle_dependents, BeadStore, NewBead};
use crate::decisions::DecisionManager;

// ---------------------------------------------------------------------------
// ReleaseOutcome
// ---------------------------------------------------------------------------

/// Terminal disposition an agent reports when handing a bead back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Work finished; dependents unblock.
    Done,
    /// Work failed; the bead returns to `open` for rematching.
    Failed,
}

// ---------------------------------------------------------------------------
// ClaimCoordinator
// ---------------------------------------------------------------------------

/// Enforces at-most-one-agent-per-bead.
///
/// Every mutation happens under the bead's project shard write lock, so a
/// concurrent second claim observes `claimed` and fails; unrelated projects
/// proceed in parallel. The coordinator never leaves a bead in an
/// intermediate state visible to readers.
pub struct ClaimCoordinator {
    store: Arc<BeadStore>,
    decisions: Arc<DecisionManager>,
    bus: EventBus,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<BeadStore>, decisions: Arc<DecisionManager>, bus: EventBus) -> Self {
        Self {
            store,
            decisions,
            bus,
        }
    }

    pub fn store(&self) -> &Arc<BeadStore> {
        &self.store
    }

    /// Atomically take an open, ready bead for `agent_id`.
    ///
    /// Claiming a bead the same agent already holds is an ok no-op.
    pub async fn claim(&self, bead_id: Uuid, agent_id: Uuid) -> Result<Bead, StoreError> {
        let project_id = self
            .store
            .project_of(bead_id)
            .ok_or(StoreError::BeadNotFound(bead_id))?;
        if self.store.project_status(project_id).await? == ProjectStatus::Closed {
            return Err(StoreError::ProjectClosed(project_id));
        }

        let shard = self.store.shard(project_id);
        let claimed = {
            let mut guard = shard.write().await;
            let blocked = guard.blocked_count.get(&bead_id).copied().unwrap_or(0);
            let bead = guard
                .beads
                .get_mut(&bead_id)
                .ok_or(StoreError::BeadNotFound(bead_id))?;

            match bead.status {
                BeadStatus::Claimed | BeadStatus::InProgress
                    if bead.assigned_to == Some(agent_id) =>
                {
                    return Ok(bead.clone());
                }
                BeadStatus::Claimed | BeadStatus::InProgress => {
                    return Err(StoreError::AlreadyClaimed(bead_id));
                }
                BeadStatus::Open => {
                    if blocked > 0 {
                        return Err(StoreError::NotReady(
                            bead_id,
                            format!("{blocked} unresolved dependencies"),
                        ));
                    }
                    bead.status = BeadStatus::Claimed;
                    bead.assigned_to = Some(agent_id);
                    bead.updated_at = Utc::now();
                    bead.clone()
                }
                other => {
                    return Err(StoreError::NotReady(
                        bead_id,
                        format!("status is {other:?}, not open"),
                    ));
                }
            }
        };

        tracing::info!(bead_id = %bead_id, agent_id = %agent_id, "bead claimed");
        self.bus.publish(
            BusEvent::new(topics::BEAD_UPDATED, "claim_coordinator")
                .with_project(project_id)
                .with_data("bead_id", serde_json::json!(bead_id))
                .with_data("status", serde_json::json!(claimed.status))
                .with_data("agent_id", serde_json::json!(agent_id)),
        );
        Ok(claimed)
    }

    /// Mark a claimed bead as begun. Stamps `in_progress`.
    pub async fn begin(&self, bead_id: Uuid, agent_id: Uuid) -> Result<Bead, StoreError> {
        let project_id = self
            .store
            .project_of(bead_id)
            .ok_or(StoreError::BeadNotFound(bead_id))?;
        let shard = self.store.shard(project_id);
        let begun = {
            let mut guard = shard.write().await;
            let bead = guard
                .beads
                .get_mut(&bead_id)
                .ok_or(StoreError::BeadNotFound(bead_id))?;
            if bead.assigned_to != Some(agent_id) {
                return Err(StoreError::InvalidArgument(format!(
                    "bead {bead_id} is not assigned to agent {agent_id}"
                )));
            }
            if bead.status != BeadStatus::Claimed {
                return Err(StoreError::InvalidTransition {
                    from: bead.status,
                    to: BeadStatus::InProgress,
                });
            }
            bead.status = BeadStatus::InProgress;
            bead.updated_at = Utc::now();
            bead.clone()
        };
        self.bus.publish(
            BusEvent::new(topics::BEAD_UPDATED, "claim_coordinator")
                .with_project(project_id)
                .with_data("bead_id", serde_json::json!(bead_id))
                .with_data("status", serde_json::json!(begun.status)),
        );
        Ok(begun)
    }

    /// Hand a bead back with a terminal disposition.
    pub async fn release(
        &self,
        bead_id: Uuid,
        agent_id: Uuid,
        outcome: ReleaseOutcome,
    ) -> Result<Bead, StoreError> {
        let project_id = self
            .store
            .project_of(bead_id)
            .ok_or(StoreError::BeadNotFound(bead_id))?;
        let shard = self.store.shard(project_id);
        let released = {
            let mut guard = shard.write().await;
            let bead = guard
                .beads
                .get_mut(&bead_id)
                .ok_or(StoreError::BeadNotFound(bead_id))?;
            if bead.assigned_to != Some(agent_id) {
                return Err(StoreError::InvalidArgument(format!(
                    "bead {bead_id} is not assigned to agent {agent_id}"
                )));
            }
            if !matches!(bead.status, BeadStatus::Claimed | BeadStatus::InProgress) {
                return Err(StoreError::InvalidTransition {
                    from: bead.status,
                    to: match outcome {
                        ReleaseOutcome::Done => BeadStatus::Done,
                        ReleaseOutcome::Failed => BeadStatus::Open,
                    },
                });
            }

            match outcome {
                ReleaseOutcome::Done => {
                    bead.status = BeadStatus::Done;
                    bead.assigned_to = None;
                    bead.closed_at = Some(Utc::now());
                    bead.updated_at = Utc::now();
                    let snapshot = bead.clone();
                    settle_dependents(&mut guard, bead_id);
                    snapshot
                }
                ReleaseOutcome::Failed => {
                    bead.status = BeadStatus::Open;
                    bead.assigned_to = None;
                    bead.updated_at = Utc::now();
                    bead.clone()
                }
            }
        };

        let topic = match outcome {
            ReleaseOutcome::Done => topics::BEAD_COMPLETED,
            ReleaseOutcome::Failed => topics::BEAD_FAILED,
        };
        tracing::info!(bead_id = %bead_id, agent_id = %agent_id, ?outcome, "bead released");
        self.bus.publish(
            BusEvent::new(topic, "claim_coordinator")
                .with_project(project_id)
                .with_data("bead_id", serde_json::json!(bead_id))
                .with_data("agent_id", serde_json::json!(agent_id)),
        );
        Ok(released)
    }

    /// Operator action: force a bead back to `open`, recording the reason.
    pub async fn redispatch(
        &self,
        bead_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<Bead, StoreError> {
        let reason = reason.into();
        let project_id = self
            .store
            .project_of(bead_id)
            .ok_or(StoreError::BeadNotFound(bead_id))?;
        if self.store.project_status(project_id).await? == ProjectStatus::Closed {
            return Err(StoreError::ProjectClosed(project_id));
        }
        let shard = self.store.shard(project_id);
        let redispatched = {
            let mut guard = shard.write().await;
            let bead = guard
                .beads
                .get_mut(&bead_id)
                .ok_or(StoreError::BeadNotFound(bead_id))?;
            if bead.status.is_terminal() {
                return Err(StoreError::InvalidTransition {
                    from: bead.status,
                    to: BeadStatus::Open,
                });
            }
            bead.status = BeadStatus::Open;
            bead.assigned_to = None;
            bead.context
                .insert("redispatch_reason".into(), reason.clone());
            bead.updated_at = Utc::now();
            bead.clone()
        };

        tracing::info!(bead_id = %bead_id, reason = %reason, "bead redispatched");
        self.bus.publish(
            BusEvent::new(topics::BEAD_REDISPATCHED, "claim_coordinator")
                .with_project(project_id)
                .with_data("bead_id", serde_json::json!(bead_id))
                .with_data("reason", serde_json::json!(reason)),
        );
        Ok(redispatched)
    }

    /// Escalate an in-progress bead into a decision.
    ///
    /// Creates a decision-type bead, wires it into `blocked_by` on the
    /// original, marks the original `blocked` and records a [`Decision`]
    /// with the given branches (defaulting to plain reopen/accept).
    pub async fn escalate(
        &self,
        bead_id: Uuid,
        reason: impl Into<String>,
        options: Option<Vec<DecisionOption>>,
    ) -> Result<Decision, StoreError> {
        let reason = reason.into();
        let project_id = self
            .store
            .project_of(bead_id)
            .ok_or(StoreError::BeadNotFound(bead_id))?;
        let shard = self.store.shard(project_id);

        let (decision_bead, original_title) = {
            let mut guard = shard.write().await;
            let original = guard
                .beads
                .get(&bead_id)
                .ok_or(StoreError::BeadNotFound(bead_id))?;
            if original.status != BeadStatus::InProgress {
                return Err(StoreError::InvalidTransition {
                    from: original.status,
                    to: BeadStatus::Blocked,
                });
            }
            let title = original.title.clone();
            let priority = original.priority;

            let mut decision_bead = Bead::new(
                format!("Decide: {reason}"),
                BeadType::Decision,
                project_id,
            );
            decision_bead.priority = priority;
            decision_bead.blocks.insert(bead_id);
            decision_bead
                .context
                .insert("escalated_from".into(), bead_id.to_string());
            guard.blocked_count.insert(decision_bead.id, 0);
            guard.beads.insert(decision_bead.id, decision_bead.clone());

            let original = guard
                .beads
                .get_mut(&bead_id)
                .ok_or(StoreError::BeadNotFound(bead_id))?;
            original.blocked_by.insert(decision_bead.id);
            original.status = BeadStatus::Blocked;
            original.assigned_to = None;
            original.updated_at = Utc::now();
            *guard.blocked_count.entry(bead_id).or_insert(0) += 1;

            (decision_bead, title)
        };
        self.store.index_bead(decision_bead.id, project_id);

        let decision = Decision {
            id: Uuid::new_v4(),
            question: format!("{reason} ({original_title})"),
            options: options.unwrap_or_else(default_escalation_options),
            default_option: Some("reopen".into()),
            bead_id,
            decision_bead_id: Some(decision_bead.id),
            project_id,
            status: DecisionStatus::Open,
            decider_id: None,
            chosen: None,
            rationale: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.decisions.insert(decision.clone()).await;

        tracing::info!(bead_id = %bead_id, decision_id = %decision.id, "bead escalated");
        self.bus.publish(
            BusEvent::new(topics::BEAD_ESCALATED, "claim_coordinator")
                .with_project(project_id)
                .with_data("bead_id", serde_json::json!(bead_id))
                .with_data("decision_id", serde_json::json!(decision.id)),
        );
        Ok(decision)
    }

    /// Resolve a decision and apply the chosen branch: close the decision
    /// bead, unblock the escalated bead per the branch action, and spawn
    /// the branch's follow-up bead if one is specified.
    pub async fn resolve_decision(
        &self,
        decision_id: Uuid,
        decider_id: impl Into<String>,
        chosen: impl Into<String>,
        rationale: Option<String>,
    ) -> Result<Decision, StoreError> {
        let (decision, option) = self
            .decisions
            .resolve(decision_id, decider_id, chosen, rationale)
            .await?;

        let shard = self.store.shard(decision.project_id);
        {
            let mut guard = shard.write().await;

            if let Some(decision_bead_id) = decision.decision_bead_id {
                if let Some(decision_bead) = guard.beads.get_mut(&decision_bead_id) {
                    if !decision_bead.status.is_terminal() {
                        decision_bead.status = BeadStatus::Done;
                        decision_bead.closed_at = Some(Utc::now());
                        decision_bead.updated_at = Utc::now();
                        settle_dependents(&mut guard, decision_bead_id);
                    }
                }
            }

            let became_terminal = {
                let original = guard
                    .beads
                    .get_mut(&decision.bead_id)
                    .ok_or(StoreError::BeadNotFound(decision.bead_id))?;
                match option.action {
                    BranchAction::Reopen if original.status == BeadStatus::Blocked => {
                        original.status = BeadStatus::Open;
                        original.updated_at = Utc::now();
                        false
                    }
                    BranchAction::Accept if original.status == BeadStatus::Blocked => {
                        original.status = BeadStatus::EscalatedResolved;
                        original.closed_at = Some(Utc::now());
                        original.updated_at = Utc::now();
                        true
                    }
                    // The bead moved on (e.g. cancelled) while the decision
                    // was pending; leave it alone.
                    _ => false,
                }
            };
            if became_terminal {
                settle_dependents(&mut guard, decision.bead_id);
            }
        }

        if let Some(template) = option.follow_up {
            let mut follow_up = NewBead::new(template.title, template.bead_type, decision.project_id);
            follow_up.description = template.description;
            follow_up.priority = template.priority;
            follow_up.tags = template.tags;
            follow_up.context = template.context;
            follow_up
                .context
                .insert("decision_id".into(), decision.id.to_string());
            if let Err(e) = self.store.create(follow_up).await {
                // Best-effort: the resolution itself stands.
                tracing::warn!(decision_id = %decision.id, error = %e, "follow-up bead creation failed");
            }
        }

        tracing::info!(
            decision_id = %decision.id,
            chosen = decision.chosen.as_deref().unwrap_or(""),
            "decision resolved"
        );
        self.bus.publish(
            BusEvent::new(topics::DECISION_RESOLVED, "claim_coordinator")
                .with_project(decision.project_id)
                .with_data("decision_id", serde_json::json!(decision.id))
                .with_data("bead_id", serde_json::json!(decision.bead_id))
                .with_data("chosen", serde_json::json!(decision.chosen)),
        );
        Ok(decision)
    }
}

fn default_escalation_options() -> Vec<DecisionOption> {
    vec![
        DecisionOption {
            label: "reopen".into(),
            action: BranchAction::Reopen,
            follow_up: None,
        },
        DecisionOption {
            label: "accept".into(),
            action: BranchAction::Accept,
            follow_up: None,
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
