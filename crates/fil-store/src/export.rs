use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fil_core::error::StoreError;
use fil_core::types::{Agent, Bead, Decision, FileLock, MotivationRule, Project};

use crate::beads::BeadStore;
use crate::conversation::{ConversationSession, ConversationStore};
use crate::decisions::DecisionManager;
use crate::locks::FileLockManager;

/// Bumped on any incompatible change to the export document shape.
/// Import enforces equality.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Document shape
// ---------------------------------------------------------------------------

pub type TableGroup = BTreeMap<String, Vec<serde_json::Value>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    /// table name -> record count, across all groups.
    pub record_counts: BTreeMap<String, usize>,
}

/// The single-document import/export format: groups of tables, each a list
/// of row maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub export_metadata: ExportMetadata,
    #[serde(default)]
    pub core: TableGroup,
    #[serde(default)]
    pub workflow: TableGroup,
    #[serde(default)]
    pub activity: TableGroup,
    #[serde(default)]
    pub tracking: TableGroup,
    #[serde(default)]
    pub logging: TableGroup,
    #[serde(default)]
    pub analytics: TableGroup,
    #[serde(default)]
    pub config: TableGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    /// Insert new rows, skip on id conflict.
    Merge,
    /// Truncate every imported table, then insert.
    Replace,
    /// Abort on the first id conflict.
    FailOnConflict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub dry_run: bool,
    pub inserted: BTreeMap<String, usize>,
    pub skipped: BTreeMap<String, usize>,
    /// Agents and motivation rules are owned outside the store. These are
    /// the rows that survived conflict resolution; the caller MUST reseed
    /// its owners from them (after truncating under `Replace`), or the
    /// `inserted` counts for those tables are not yet true.
    #[serde(skip)]
    pub agents: Vec<Agent>,
    #[serde(skip)]
    pub rules: Vec<MotivationRule>,
}

fn rows<T: Serialize>(items: &[T]) -> Vec<serde_json::Value> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).unwrap_or(serde_json::Value::Null))
        .collect()
}

fn parse_rows<T: for<'de> Deserialize<'de>>(
    group: &TableGroup,
    table: &str,
) -> Result<Vec<T>, StoreError> {
    group
        .get(table)
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    serde_json::from_value(row.clone()).map_err(|e| {
                        StoreError::InvalidArgument(format!("bad row in {table}: {e}"))
                    })
                })
                .collect()
        })
        .unwrap_or_else(|| Ok(Vec::new()))
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Snapshot the full system state into a single JSON-serializable document.
pub async fn export_state(
    store: &BeadStore,
    decisions: &DecisionManager,
    conversations: &ConversationStore,
    locks: &FileLockManager,
    agents: &[Agent],
    rules: &[MotivationRule],
) -> ExportDocument {
    let projects = store.list_projects().await;
    let beads = store.list(&crate::beads::BeadFilter::default()).await;
    let decision_rows = decisions.all().await;
    let sessions = conversations.all().await;
    let lock_rows = locks.list(None);

    let mut core = TableGroup::new();
    core.insert("projects".into(), rows(&projects));
    core.insert("beads".into(), rows(&beads));

    let mut workflow = TableGroup::new();
    workflow.insert("decisions".into(), rows(&decision_rows));
    workflow.insert("motivation_rules".into(), rows(rules));

    let mut activity = TableGroup::new();
    activity.insert("agents".into(), rows(agents));
    activity.insert("conversations".into(), rows(&sessions));

    let mut tracking = TableGroup::new();
    tracking.insert("file_locks".into(), rows(&lock_rows));

    let mut record_counts = BTreeMap::new();
    for group in [&core, &workflow, &activity, &tracking] {
        for (table, rows) in group {
            record_counts.insert(table.clone(), rows.len());
        }
    }

    ExportDocument {
        export_metadata: ExportMetadata {
            schema_version: SCHEMA_VERSION,
            exported_at: Utc::now(),
            record_counts,
        },
        core,
        workflow,
        activity,
        tracking,
        logging: TableGroup::new(),
        analytics: TableGroup::new(),
        config: TableGroup::new(),
    }
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Load an export document into the stores.
///
/// Validation (schema version, row parsing, conflict scan) always runs;
/// with `dry_run` nothing is mutated. Under `FailOnConflict` the first
/// conflicting id aborts before any write.
///
/// Agents and motivation rules live outside the store, so their owners'
/// current ids come in through `existing_agents` / `existing_rules` and
/// get the same conflict semantics as every other table. The surviving
/// rows come back on the report for the caller to reseed.
#[allow(clippy::too_many_arguments)]
pub async fn import_state(
    document: &ExportDocument,
    store: &BeadStore,
    decisions: &DecisionManager,
    conversations: &ConversationStore,
    locks: &FileLockManager,
    existing_agents: &[Uuid],
    existing_rules: &[Uuid],
    strategy: ImportStrategy,
    dry_run: bool,
) -> Result<ImportReport, StoreError> {
    if document.export_metadata.schema_version != SCHEMA_VERSION {
        return Err(StoreError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION,
            found: document.export_metadata.schema_version,
        });
    }

    let projects: Vec<Project> = parse_rows(&document.core, "projects")?;
    let beads: Vec<Bead> = parse_rows(&document.core, "beads")?;
    let decision_rows: Vec<Decision> = parse_rows(&document.workflow, "decisions")?;
    let rules: Vec<MotivationRule> = parse_rows(&document.workflow, "motivation_rules")?;
    let agents: Vec<Agent> = parse_rows(&document.activity, "agents")?;
    let sessions: Vec<ConversationSession> = parse_rows(&document.activity, "conversations")?;
    let lock_rows: Vec<FileLock> = parse_rows(&document.tracking, "file_locks")?;

    let mut report = ImportReport {
        dry_run,
        ..Default::default()
    };

    if strategy == ImportStrategy::Replace {
        if !dry_run {
            store.clear_all().await;
            decisions.clear_all().await;
            conversations.clear_all().await;
            locks.clear_all();
        }
        // After truncation nothing can conflict; the agents and
        // motivation_rules counts hold once the caller truncates and
        // reseeds their owners from the report.
        report.inserted.insert("projects".into(), projects.len());
        report.inserted.insert("beads".into(), beads.len());
        report
            .inserted
            .insert("decisions".into(), decision_rows.len());
        report
            .inserted
            .insert("conversations".into(), sessions.len());
        report.inserted.insert("file_locks".into(), lock_rows.len());
        report.inserted.insert("agents".into(), agents.len());
        report
            .inserted
            .insert("motivation_rules".into(), rules.len());

        if !dry_run {
            for project in projects {
                store.insert_project(project).await;
            }
            for bead in beads {
                store.insert_bead_raw(bead).await;
            }
            store.rebuild_blocked_counts().await;
            for decision in decision_rows {
                decisions.insert_raw(decision).await;
            }
            for session in sessions {
                conversations.insert(session).await;
            }
            for lock in lock_rows {
                locks.insert_raw(lock);
            }
        }
        report.agents = agents;
        report.rules = rules;
        return Ok(report);
    }

    // Merge / FailOnConflict: scan conflicts first so FailOnConflict aborts
    // before any write.
    let mut project_conflicts = 0usize;
    for project in &projects {
        if store.has_project(project.id).await {
            if strategy == ImportStrategy::FailOnConflict {
                return Err(StoreError::ImportConflict {
                    table: "projects".into(),
                    id: project.id.to_string(),
                });
            }
            project_conflicts += 1;
        }
    }
    let mut bead_conflicts = 0usize;
    for bead in &beads {
        if store.project_of(bead.id).is_some() {
            if strategy == ImportStrategy::FailOnConflict {
                return Err(StoreError::ImportConflict {
                    table: "beads".into(),
                    id: bead.id.to_string(),
                });
            }
            bead_conflicts += 1;
        }
    }
    let mut decision_conflicts = 0usize;
    for decision in &decision_rows {
        if decisions.contains(decision.id).await {
            if strategy == ImportStrategy::FailOnConflict {
                return Err(StoreError::ImportConflict {
                    table: "decisions".into(),
                    id: decision.id.to_string(),
                });
            }
            decision_conflicts += 1;
        }
    }
    let mut session_conflicts = 0usize;
    for session in &sessions {
        if conversations.contains(session.session_id).await {
            if strategy == ImportStrategy::FailOnConflict {
                return Err(StoreError::ImportConflict {
                    table: "conversations".into(),
                    id: session.session_id.to_string(),
                });
            }
            session_conflicts += 1;
        }
    }
    let mut lock_conflicts = 0usize;
    for lock in &lock_rows {
        if locks.contains(lock.project_id, &lock.path) {
            if strategy == ImportStrategy::FailOnConflict {
                return Err(StoreError::ImportConflict {
                    table: "file_locks".into(),
                    id: format!("{}:{}", lock.project_id, lock.path),
                });
            }
            lock_conflicts += 1;
        }
    }
    let mut agent_conflicts = 0usize;
    let mut fresh_agents = Vec::with_capacity(agents.len());
    for agent in agents {
        if existing_agents.contains(&agent.id) {
            if strategy == ImportStrategy::FailOnConflict {
                return Err(StoreError::ImportConflict {
                    table: "agents".into(),
                    id: agent.id.to_string(),
                });
            }
            agent_conflicts += 1;
        } else {
            fresh_agents.push(agent);
        }
    }
    let mut rule_conflicts = 0usize;
    let mut fresh_rules = Vec::with_capacity(rules.len());
    for rule in rules {
        if existing_rules.contains(&rule.id) {
            if strategy == ImportStrategy::FailOnConflict {
                return Err(StoreError::ImportConflict {
                    table: "motivation_rules".into(),
                    id: rule.id.to_string(),
                });
            }
            rule_conflicts += 1;
        } else {
            fresh_rules.push(rule);
        }
    }

    report
        .inserted
        .insert("projects".into(), projects.len() - project_conflicts);
    report.skipped.insert("projects".into(), project_conflicts);
    report
        .inserted
        .insert("beads".into(), beads.len() - bead_conflicts);
    report.skipped.insert("beads".into(), bead_conflicts);
    report
        .inserted
        .insert("decisions".into(), decision_rows.len() - decision_conflicts);
    report
        .skipped
        .insert("decisions".into(), decision_conflicts);
    report
        .inserted
        .insert("conversations".into(), sessions.len() - session_conflicts);
    report
        .skipped
        .insert("conversations".into(), session_conflicts);
    report
        .inserted
        .insert("file_locks".into(), lock_rows.len() - lock_conflicts);
    report.skipped.insert("file_locks".into(), lock_conflicts);
    report.inserted.insert("agents".into(), fresh_agents.len());
    report.skipped.insert("agents".into(), agent_conflicts);
    report
        .inserted
        .insert("motivation_rules".into(), fresh_rules.len());
    report
        .skipped
        .insert("motivation_rules".into(), rule_conflicts);

    if !dry_run {
        for project in projects {
            if !store.has_project(project.id).await {
                store.insert_project(project).await;
            }
        }
        for bead in beads {
            if store.project_of(bead.id).is_none() {
                store.insert_bead_raw(bead).await;
            }
        }
        store.rebuild_blocked_counts().await;
        for decision in decision_rows {
            if !decisions.contains(decision.id).await {
                decisions.insert_raw(decision).await;
            }
        }
        for session in sessions {
            if !conversations.contains(session.session_id).await {
                conversations.insert(session).await;
            }
        }
        for lock in lock_rows {
            if !locks.contains(lock.project_id, &lock.path) {
                locks.insert_raw(lock);
            }
        }
    }

    report.agents = fresh_agents;
    report.rules = fresh_rules;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
