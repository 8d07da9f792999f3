use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BeadStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    Claimed,
    InProgress,
    Blocked,
    Done,
    Cancelled,
    EscalatedResolved,
    Failed,
}

impl BeadStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Operator-initiated cancellation is allowed from any non-terminal
    /// state; every other edge is guarded by the coordinator or dispatcher.
    pub fn can_transition_to(&self, target: &BeadStatus) -> bool {
        matches!(
            (self, target),
            (BeadStatus::Open, BeadStatus::Claimed)
                | (BeadStatus::Claimed, BeadStatus::InProgress)
                | (BeadStatus::Claimed, BeadStatus::Open)
                | (BeadStatus::InProgress, BeadStatus::Done)
                | (BeadStatus::InProgress, BeadStatus::Failed)
                | (BeadStatus::InProgress, BeadStatus::Open)
                | (BeadStatus::InProgress, BeadStatus::Blocked)
                | (BeadStatus::Blocked, BeadStatus::Open)
                | (BeadStatus::Blocked, BeadStatus::EscalatedResolved)
                | (BeadStatus::Failed, BeadStatus::Open)
        ) || (!self.is_terminal() && *target == BeadStatus::Cancelled)
    }

    /// Terminal statuses never transition again and unblock dependents.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BeadStatus::Done | BeadStatus::Cancelled | BeadStatus::EscalatedResolved
        )
    }
}

// ---------------------------------------------------------------------------
// BeadType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeadType {
    Task,
    Bug,
    Decision,
    PrReview,
    Chore,
}

// ---------------------------------------------------------------------------
// Bead
// ---------------------------------------------------------------------------

/// The atomic unit of work: a row in the work graph with a status and
/// dependency edges. Beads reference each other by id, never by pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub bead_type: BeadType,
    /// Ordinal 0–3, 0 is the highest priority.
    pub priority: u8,
    pub status: BeadStatus,
    pub project_id: Uuid,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Beads that must reach a terminal status before this one is ready.
    #[serde(default)]
    pub blocked_by: BTreeSet<Uuid>,
    /// Inverse of `blocked_by`; maintained by the store on every write.
    #[serde(default)]
    pub blocks: BTreeSet<Uuid>,
    #[serde(default)]
    pub related_to: BTreeSet<Uuid>,
    #[serde(default)]
    pub children: BTreeSet<Uuid>,
    /// Free-form agent-readable scratchpad, merged per key on update.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub assigned_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Bead {
    pub fn new(title: impl Into<String>, bead_type: BeadType, project_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            bead_type,
            priority: 2,
            status: BeadStatus::Open,
            project_id,
            parent_id: None,
            tags: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
            blocks: BTreeSet::new(),
            related_to: BTreeSet::new(),
            children: BTreeSet::new(),
            context: BTreeMap::new(),
            assigned_to: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Open,
    Closed,
    Perpetual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectComment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A top-level namespace scoping beads, agents and file locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub status: ProjectStatus,
    pub sticky: bool,
    /// Append-only; comments are never edited in place.
    #[serde(default)]
    pub comments: Vec<ProjectComment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: ProjectStatus::Open,
            sticky: false,
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Paused,
    Stopped,
}

/// Character sheet bound to an agent when its session is assembled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Persona {
    pub character: String,
    pub mission: String,
    pub personality: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub instructions: String,
}

/// A logical worker that claims and completes beads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub role: String,
    pub persona: Persona,
    /// Home project; multi-project agents may claim outside it.
    pub project_id: Uuid,
    pub provider_id: String,
    pub status: AgentStatus,
    pub current_bead_id: Option<Uuid>,
    #[serde(default)]
    pub multi_project: bool,
    pub created_at: DateTime<Utc>,
    /// Soft swarm presence; observability only, never a scheduling input.
    pub last_activity: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        project_id: Uuid,
        provider_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role: role.into(),
            persona: Persona::default(),
            project_id,
            provider_id: provider_id.into(),
            status: AgentStatus::Idle,
            current_bead_id: None,
            multi_project: false,
            created_at: now,
            last_activity: now,
        }
    }
}

// ---------------------------------------------------------------------------
// FileLock
// ---------------------------------------------------------------------------

/// Exclusive advisory reservation over a path within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub project_id: Uuid,
    /// Canonical form; two paths normalizing identically share a lock.
    pub path: String,
    pub agent_id: Uuid,
    pub bead_id: Option<Uuid>,
    pub acquired_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Open,
    Resolved,
}

/// What resolving a branch does to the bead that escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchAction {
    /// Return the escalated bead to `open` for another attempt.
    Reopen,
    /// Accept the escalated bead as resolved (`escalated_resolved`).
    Accept,
}

/// A selectable branch of a decision, optionally producing a follow-up bead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOption {
    pub label: String,
    pub action: BranchAction,
    #[serde(default)]
    pub follow_up: Option<BeadTemplate>,
}

/// A fork in the work graph requiring external resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<DecisionOption>,
    pub default_option: Option<String>,
    /// Bead that escalated into this decision.
    pub bead_id: Uuid,
    /// The decision-type bead blocking the escalated one.
    pub decision_bead_id: Option<Uuid>,
    pub project_id: Uuid,
    pub status: DecisionStatus,
    pub decider_id: Option<String>,
    pub chosen: Option<String>,
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// BeadTemplate
// ---------------------------------------------------------------------------

/// Blueprint for a bead created by a motivation rule or decision branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeadTemplate {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub bead_type: BeadType,
    #[serde(default = "default_template_priority")]
    pub priority: u8,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

fn default_template_priority() -> u8 {
    2
}

// ---------------------------------------------------------------------------
// Motivation rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Scheduled,
    Event,
    Idle,
    Threshold,
}

/// A trigger → action rule evaluated by the motivation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotivationRule {
    pub id: Uuid,
    pub name: String,
    pub rule_type: RuleType,
    /// Opaque predicate key resolved against the registered evaluators.
    pub condition: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Minimum seconds between fires.
    pub cooldown_secs: u64,
    pub priority: u8,
    #[serde(default)]
    pub create_bead: Option<BeadTemplate>,
    #[serde(default)]
    pub wake_agent: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub next_trigger_at: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub enabled: bool,
    /// Built-in rules are seeded at startup and may never be deleted.
    pub built_in: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a single rule fire, kept in the engine history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub fired_at: DateTime<Utc>,
    pub created_bead_id: Option<Uuid>,
    pub woke_agent_id: Option<Uuid>,
    /// Best-effort effect failures; never suppress the next fire.
    #[serde(default)]
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// BusEvent
// ---------------------------------------------------------------------------

/// A timestamped tagged message broadcast via the in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: Uuid,
    /// Dotted namespace, e.g. `bead.created`.
    pub event_type: String,
    pub source: String,
    pub project_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl BusEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: source.into(),
            project_id: None,
            timestamp: Utc::now(),
            data: serde_json::Map::new(),
        }
    }

    pub fn with_project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Conversation messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry in a bead's transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    /// Approximate count (`len / 4`); good enough for budgeting.
    pub tokens: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_claims_then_progresses() {
        assert!(BeadStatus::Open.can_transition_to(&BeadStatus::Claimed));
        assert!(BeadStatus::Claimed.can_transition_to(&BeadStatus::InProgress));
        assert!(BeadStatus::InProgress.can_transition_to(&BeadStatus::Done));
    }

    #[test]
    fn claimed_can_fall_back_to_open() {
        assert!(BeadStatus::Claimed.can_transition_to(&BeadStatus::Open));
        assert!(BeadStatus::InProgress.can_transition_to(&BeadStatus::Open));
        assert!(BeadStatus::Failed.can_transition_to(&BeadStatus::Open));
    }

    #[test]
    fn escalation_path() {
        assert!(BeadStatus::InProgress.can_transition_to(&BeadStatus::Blocked));
        assert!(BeadStatus::Blocked.can_transition_to(&BeadStatus::Open));
        assert!(BeadStatus::Blocked.can_transition_to(&BeadStatus::EscalatedResolved));
    }

    #[test]
    fn cancel_allowed_from_any_non_terminal() {
        for s in [
            BeadStatus::Open,
            BeadStatus::Claimed,
            BeadStatus::InProgress,
            BeadStatus::Blocked,
            BeadStatus::Failed,
        ] {
            assert!(s.can_transition_to(&BeadStatus::Cancelled), "{s:?}");
        }
        for s in [
            BeadStatus::Done,
            BeadStatus::Cancelled,
            BeadStatus::EscalatedResolved,
        ] {
            assert!(!s.can_transition_to(&BeadStatus::Cancelled), "{s:?}");
        }
    }

    #[test]
    fn terminal_states_never_leave() {
        for s in [
            BeadStatus::Done,
            BeadStatus::Cancelled,
            BeadStatus::EscalatedResolved,
        ] {
            assert!(s.is_terminal());
            assert!(!s.can_transition_to(&BeadStatus::Open));
            assert!(!s.can_transition_to(&BeadStatus::Claimed));
        }
    }

    #[test]
    fn open_cannot_skip_claim() {
        assert!(!BeadStatus::Open.can_transition_to(&BeadStatus::InProgress));
        assert!(!BeadStatus::Open.can_transition_to(&BeadStatus::Done));
    }

    #[test]
    fn bead_new_defaults() {
        let project = Uuid::new_v4();
        let bead = Bead::new("wire up the dispatcher", BeadType::Task, project);
        assert_eq!(bead.status, BeadStatus::Open);
        assert_eq!(bead.project_id, project);
        assert_eq!(bead.priority, 2);
        assert!(bead.assigned_to.is_none());
        assert!(bead.blocked_by.is_empty());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&BeadStatus::EscalatedResolved).unwrap();
        assert_eq!(json, "\"escalated_resolved\"");
        let json = serde_json::to_string(&BeadStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn bead_type_serializes_kebab_case() {
        let json = serde_json::to_string(&BeadType::PrReview).unwrap();
        assert_eq!(json, "\"pr-review\"");
    }

    #[test]
    fn bus_event_builder() {
        let project = Uuid::new_v4();
        let ev = BusEvent::new("bead.created", "bead_store")
            .with_project(project)
            .with_data("bead_id", serde_json::json!("abc"));
        assert_eq!(ev.event_type, "bead.created");
        assert_eq!(ev.project_id, Some(project));
        assert_eq!(ev.data["bead_id"], "abc");
    }
}
