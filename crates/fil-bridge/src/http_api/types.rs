//! Request/response DTOs for the HTTP API.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use uuid::Uuid;

use fil_core::types::{BeadStatus, BeadType, DecisionOption, ProjectStatus};
use fil_store::{BeadFilter, BeadPatch, ImportStrategy};

use crate::api_error::ApiError;

// ---------------------------------------------------------------------------
// Beads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateBeadRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_bead_type")]
    pub bead_type: BeadType,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub project_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub blocked_by: BTreeSet<Uuid>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

fn default_bead_type() -> BeadType {
    BeadType::Task
}

fn default_priority() -> u8 {
    2
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateBeadRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bead_type: Option<BeadType>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub status: Option<BeadStatus>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub blocked_by: Option<BTreeSet<Uuid>>,
    #[serde(default)]
    pub related_to: Option<BTreeSet<Uuid>>,
    /// Explicit null clears the assignee.
    #[serde(default, with = "double_option")]
    pub assigned_to: Option<Option<Uuid>>,
    #[serde(default)]
    pub context: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub replace_context: bool,
}

/// Distinguish an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(d: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(d).map(Some)
    }
}

impl From<UpdateBeadRequest> for BeadPatch {
    fn from(req: UpdateBeadRequest) -> Self {
        BeadPatch {
            title: req.title,
            description: req.description,
            bead_type: req.bead_type,
            priority: req.priority,
            status: req.status,
            tags: req.tags,
            blocked_by: req.blocked_by,
            related_to: req.related_to,
            assigned_to: req.assigned_to,
            context: req.context,
            replace_context: req.replace_context,
        }
    }
}

/// Query parameters for bead listings. `assigned_to` takes a comma-
/// separated set of agent ids.
#[derive(Debug, Default, Deserialize)]
pub struct BeadQuery {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<BeadStatus>,
    #[serde(default, rename = "type")]
    pub bead_type: Option<BeadType>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub assigned_to: Option<String>,
}

impl BeadQuery {
    pub fn into_filter(self) -> Result<BeadFilter, ApiError> {
        let assigned_to = match self.assigned_to {
            None => None,
            Some(raw) => {
                let mut agents = Vec::new();
                for part in raw.split(',').filter(|p| !p.is_empty()) {
                    let id = part.parse::<Uuid>().map_err(|_| {
                        ApiError::bad_request(format!("bad agent id in assigned_to: {part}"))
                    })?;
                    agents.push(id);
                }
                Some(agents)
            }
        };
        Ok(BeadFilter {
            project_id: self.project_id,
            status: self.status,
            bead_type: self.bead_type,
            priority: self.priority,
            assigned_to,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RedispatchRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct EscalateRequest {
    pub reason: String,
    #[serde(default)]
    pub options: Option<Vec<DecisionOption>>,
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ProjectStatusRequest {
    pub status: ProjectStatus,
    /// Decision bead approving closure despite open beads.
    #[serde(default)]
    pub approved_by: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectCommentRequest {
    pub author: String,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub decider_id: String,
    pub decision: String,
    #[serde(default)]
    pub rationale: Option<String>,
}

// ---------------------------------------------------------------------------
// File locks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateLockRequest {
    pub project_id: Uuid,
    pub file_path: String,
    pub agent_id: Uuid,
    #[serde(default)]
    pub bead_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct LockQuery {
    #[serde(default)]
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseLockQuery {
    pub agent_id: Uuid,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SpawnAgentRequest {
    pub name: String,
    pub role: String,
    pub project_id: Uuid,
    pub provider_id: String,
    #[serde(default)]
    pub persona: Option<fil_core::types::Persona>,
    #[serde(default)]
    pub multi_project: bool,
}

// ---------------------------------------------------------------------------
// Motivations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub rule_type: fil_core::types::RuleType,
    pub condition: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub create_bead: Option<fil_core::types::BeadTemplate>,
    #[serde(default)]
    pub wake_agent: Option<Uuid>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
}

fn default_cooldown() -> u64 {
    300
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRuleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default, with = "double_option")]
    pub create_bead: Option<Option<fil_core::types::BeadTemplate>>,
    #[serde(default, with = "double_option")]
    pub wake_agent: Option<Option<Uuid>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RuleQuery {
    #[serde(default, rename = "type")]
    pub rule_type: Option<fil_core::types::RuleType>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

// ---------------------------------------------------------------------------
// Events / misc
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct EventStreamQuery {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default, rename = "type")]
    pub type_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecentEventsQuery {
    #[serde(default = "default_recent")]
    pub n: usize,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default, rename = "type")]
    pub type_prefix: Option<String>,
}

fn default_recent() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct GraphQuery {
    pub project_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    #[serde(default = "default_strategy")]
    pub strategy: ImportStrategy,
    #[serde(default)]
    pub dry_run: bool,
    pub document: fil_store::ExportDocument,
}

fn default_strategy() -> ImportStrategy {
    ImportStrategy::Merge
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct LogQueryParams {
    #[serde(default)]
    pub min_level: Option<fil_bus::LogLevel>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub since_seq: Option<u64>,
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    200
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    /// Registry id of the backend; falls back to the configured default.
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(flatten)]
    pub request: fil_harness::ChatRequest,
}
