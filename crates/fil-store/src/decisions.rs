use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use fil_bus::{topics, EventBus};
use fil_core::error::StoreError;
use fil_core::types::{BusEvent, Decision, DecisionOption, DecisionStatus};

/// Owner of decision records: human-in-loop branches created by
/// escalation and resolved by an external decider.
///
/// The branch semantics (unblocking the escalated bead, spawning a
/// follow-up) live in the claim coordinator; this store only tracks the
/// records and validates resolution payloads.
pub struct DecisionManager {
    decisions: RwLock<HashMap<Uuid, Decision>>,
    bus: EventBus,
}

impl DecisionManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            decisions: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub(crate) async fn insert(&self, decision: Decision) {
        self.bus.publish(
            BusEvent::new(topics::DECISION_CREATED, "decision_manager")
                .with_project(decision.project_id)
                .with_data("decision_id", serde_json::json!(decision.id))
                .with_data("question", serde_json::json!(decision.question)),
        );
        self.decisions.write().await.insert(decision.id, decision);
    }

    pub async fn get(&self, id: Uuid) -> Result<Decision, StoreError> {
        self.decisions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::DecisionNotFound(id))
    }

    pub async fn list(
        &self,
        project_id: Option<Uuid>,
        status: Option<DecisionStatus>,
    ) -> Vec<Decision> {
        let mut out: Vec<Decision> = self
            .decisions
            .read()
            .await
            .values()
            .filter(|d| project_id.is_none_or(|p| d.project_id == p))
            .filter(|d| status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|d| d.created_at);
        out
    }

    /// Mark a decision resolved and return it together with the chosen
    /// branch. Resolving twice is a conflict; an unknown option label is
    /// an invalid argument.
    pub(crate) async fn resolve(
        &self,
        id: Uuid,
        decider_id: impl Into<String>,
        chosen: impl Into<String>,
        rationale: Option<String>,
    ) -> Result<(Decision, DecisionOption), StoreError> {
        let chosen = chosen.into();
        let mut decisions = self.decisions.write().await;
        let decision = decisions.get_mut(&id).ok_or(StoreError::DecisionNotFound(id))?;

        if decision.status == DecisionStatus::Resolved {
            return Err(StoreError::InvalidArgument(format!(
                "decision {id} is already resolved"
            )));
        }

        let option = decision
            .options
            .iter()
            .find(|o| o.label == chosen)
            .cloned()
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!("unknown decision option: {chosen}"))
            })?;

        decision.status = DecisionStatus::Resolved;
        decision.decider_id = Some(decider_id.into());
        decision.chosen = Some(chosen);
        decision.rationale = rationale;
        decision.resolved_at = Some(Utc::now());

        Ok((decision.clone(), option))
    }

    /// Insert without publishing; used by import.
    pub(crate) async fn insert_raw(&self, decision: Decision) {
        self.decisions.write().await.insert(decision.id, decision);
    }

    pub(crate) async fn contains(&self, id: Uuid) -> bool {
        self.decisions.read().await.contains_key(&id)
    }

    pub(crate) async fn clear_all(&self) {
        self.decisions.write().await.clear();
    }

    pub(crate) async fn all(&self) -> Vec<Decision> {
        self.decisions.read().await.values().cloned().collect()
    }

    /// All decisions currently blocking the given bead.
    pub async fn open_for_bead(&self, bead_id: Uuid) -> Vec<Decision> {
        self.decisions
            .read()
            .await
            .values()
            .filter(|d| d.bead_id == bead_id && d.status == DecisionStatus::Open)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fil_core::types::BranchAction;

    fn decision(project: Uuid, bead: Uuid) -> Decision {
        Decision {
            id: Uuid::new_v4(),
            question: "merge or rework?".into(),
            options: vec![
                DecisionOption {
                    label: "rework".into(),
                    action: BranchAction::Reopen,
                    follow_up: None,
                },
                DecisionOption {
                    label: "accept".into(),
                    action: BranchAction::Accept,
                    follow_up: None,
                },
            ],
            default_option: Some("rework".into()),
            bead_id: bead,
            decision_bead_id: None,
            project_id: project,
            status: DecisionStatus::Open,
            decider_id: None,
            chosen: None,
            rationale: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn resolve_marks_and_returns_branch() {
        let mgr = DecisionManager::new(EventBus::default());
        let d = decision(Uuid::new_v4(), Uuid::new_v4());
        let id = d.id;
        mgr.insert(d).await;

        let (resolved, option) = mgr
            .resolve(id, "operator-1", "accept", Some("good enough".into()))
            .await
            .unwrap();
        assert_eq!(resolved.status, DecisionStatus::Resolved);
        assert_eq!(resolved.chosen.as_deref(), Some("accept"));
        assert_eq!(option.action, BranchAction::Accept);
    }

    #[tokio::test]
    async fn double_resolution_is_rejected() {
        let mgr = DecisionManager::new(EventBus::default());
        let d = decision(Uuid::new_v4(), Uuid::new_v4());
        let id = d.id;
        mgr.insert(d).await;

        mgr.resolve(id, "op", "accept", None).await.unwrap();
        assert!(mgr.resolve(id, "op", "rework", None).await.is_err());
    }

    #[tokio::test]
    async fn unknown_option_is_invalid() {
        let mgr = DecisionManager::new(EventBus::default());
        let d = decision(Uuid::new_v4(), Uuid::new_v4());
        let id = d.id;
        mgr.insert(d).await;

        let err = mgr.resolve(id, "op", "ship it", None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        // Still open after the failed resolution.
        assert_eq!(mgr.get(id).await.unwrap().status, DecisionStatus::Open);
    }

    #[tokio::test]
    async fn list_filters_by_project_and_status() {
        let mgr = DecisionManager::new(EventBus::default());
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        mgr.insert(decision(p1, Uuid::new_v4())).await;
        let d2 = decision(p2, Uuid::new_v4());
        let d2_id = d2.id;
        mgr.insert(d2).await;
        mgr.resolve(d2_id, "op", "accept", None).await.unwrap();

        assert_eq!(mgr.list(Some(p1), None).await.len(), 1);
        assert_eq!(mgr.list(None, Some(DecisionStatus::Resolved)).await.len(), 1);
        assert_eq!(mgr.list(None, None).await.len(), 2);
    }
}
