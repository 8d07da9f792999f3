use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use fil_bus::{topics, EventBus};
use fil_core::error::StoreError;
use fil_core::types::{Bead, BeadStatus, BeadType, BusEvent, Project, ProjectComment, ProjectStatus};

// ---------------------------------------------------------------------------
// Request / filter types
// ---------------------------------------------------------------------------

/// Fields for creating a bead. Everything not listed takes the
/// [`Bead::new`] default.
#[derive(Debug, Clone)]
pub struct NewBead {
    pub title: String,
    pub description: Option<String>,
    pub bead_type: BeadType,
    pub priority: u8,
    pub project_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub tags: BTreeSet<String>,
    pub blocked_by: BTreeSet<Uuid>,
    pub context: BTreeMap<String, String>,
}

impl NewBead {
    pub fn new(title: impl Into<String>, bead_type: BeadType, project_id: Uuid) -> Self {
        Self {
            title: title.into(),
            description: None,
            bead_type,
            priority: 2,
            project_id,
            parent_id: None,
            tags: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
            context: BTreeMap::new(),
        }
    }
}

/// Conjunctive filter over bead listings.
///
/// `assigned_to` uses set membership: a bead matches when its assignee is
/// any of the listed agents.
#[derive(Debug, Clone, Default)]
pub struct BeadFilter {
    pub project_id: Option<Uuid>,
    pub status: Option<BeadStatus>,
    pub bead_type: Option<BeadType>,
    pub priority: Option<u8>,
    pub assigned_to: Option<Vec<Uuid>>,
}

impl BeadFilter {
    fn matches(&self, bead: &Bead) -> bool {
        if let Some(project) = self.project_id {
            if bead.project_id != project {
                return false;
            }
        }
        if let Some(status) = self.status {
            if bead.status != status {
                return false;
            }
        }
        if let Some(bead_type) = self.bead_type {
            if bead.bead_type != bead_type {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if bead.priority != priority {
                return false;
            }
        }
        if let Some(ref agents) = self.assigned_to {
            match bead.assigned_to {
                Some(agent) if agents.contains(&agent) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Partial update. `None` fields are untouched; equivalent payloads are
/// idempotent (a second application changes nothing and publishes nothing).
#[derive(Debug, Clone, Default)]
pub struct BeadPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub bead_type: Option<BeadType>,
    pub priority: Option<u8>,
    pub status: Option<BeadStatus>,
    pub tags: Option<BTreeSet<String>>,
    pub blocked_by: Option<BTreeSet<Uuid>>,
    pub related_to: Option<BTreeSet<Uuid>>,
    /// `Some(None)` clears the assignment.
    pub assigned_to: Option<Option<Uuid>>,
    /// Merged at the string-key level (last write wins per key) unless
    /// `replace_context` is set, which swaps the whole map.
    pub context: Option<BTreeMap<String, String>>,
    pub replace_context: bool,
}

// ---------------------------------------------------------------------------
// Work graph view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub title: String,
    pub status: BeadStatus,
    pub bead_type: BeadType,
    pub priority: u8,
    pub blocked_by: Vec<Uuid>,
    pub blocks: Vec<Uuid>,
    pub children: Vec<Uuid>,
}

/// Directed graph of the beads within one project, adjacency-list form.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkGraph {
    pub project_id: Uuid,
    pub nodes: BTreeMap<Uuid, GraphNode>,
}

// ---------------------------------------------------------------------------
// Shard
// ---------------------------------------------------------------------------

/// Per-project slice of the store. All writes to a project's beads happen
/// under this shard's write lock, so distinct projects never serialize
/// against each other.
pub(crate) struct Shard {
    pub(crate) beads: HashMap<Uuid, Bead>,
    /// Unresolved-dependency count per bead; ready when zero and open.
    pub(crate) blocked_count: HashMap<Uuid, usize>,
}

impl Shard {
    fn new() -> Self {
        Self {
            beads: HashMap::new(),
            blocked_count: HashMap::new(),
        }
    }
}

/// `true` when adding `proposed` as the blocked-by set of `bead_id` would
/// close a cycle. Walks the existing `blocked_by` edges depth-first from
/// each proposed dependency.
pub(crate) fn creates_cycle(shard: &Shard, bead_id: Uuid, proposed: &BTreeSet<Uuid>) -> bool {
    let mut stack: Vec<Uuid> = proposed.iter().copied().collect();
    let mut seen: HashSet<Uuid> = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == bead_id {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(bead) = shard.beads.get(&node) {
            stack.extend(bead.blocked_by.iter().copied());
        }
    }
    false
}

/// Decrement the unresolved-dependency count of everything the given bead
/// blocks. Called exactly once, at the moment the bead turns terminal.
/// Returns the ids that just became unblocked (count hit zero).
pub(crate) fn settle_dependents(shard: &mut Shard, bead_id: Uuid) -> Vec<Uuid> {
    let dependents: Vec<Uuid> = shard
        .beads
        .get(&bead_id)
        .map(|b| b.blocks.iter().copied().collect())
        .unwrap_or_default();

    let mut newly_ready = Vec::new();
    for dep in dependents {
        if let Some(count) = shard.blocked_count.get_mut(&dep) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                newly_ready.push(dep);
            }
        }
    }
    newly_ready
}

// ---------------------------------------------------------------------------
// BeadStore
// ---------------------------------------------------------------------------

/// Exclusive owner of bead and project records.
///
/// Reads take a shard read lock; writes take the shard write lock of the
/// bead's project only. The dependency graph is validated on every write:
/// the store never materializes a cycle.
pub struct BeadStore {
    shards: DashMap<Uuid, Arc<RwLock<Shard>>>,
    /// bead id -> project id, for O(1) shard lookup.
    bead_index: DashMap<Uuid, Uuid>,
    projects: RwLock<HashMap<Uuid, Project>>,
    bus: EventBus,
}

impl BeadStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            shards: DashMap::new(),
            bead_index: DashMap::new(),
            projects: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub(crate) fn shard(&self, project_id: Uuid) -> Arc<RwLock<Shard>> {
        self.shards
            .entry(project_id)
            .or_insert_with(|| Arc::new(RwLock::new(Shard::new())))
            .clone()
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn project_of(&self, bead_id: Uuid) -> Option<Uuid> {
        self.bead_index.get(&bead_id).map(|e| *e.value())
    }

    pub(crate) fn index_bead(&self, bead_id: Uuid, project_id: Uuid) {
        self.bead_index.insert(bead_id, project_id);
    }

    /// Insert a bead as-is, without validation or events. Used by import;
    /// callers must run [`BeadStore::rebuild_blocked_counts`] afterwards.
    pub(crate) async fn insert_bead_raw(&self, bead: Bead) {
        let shard = self.shard(bead.project_id);
        let mut guard = shard.write().await;
        self.bead_index.insert(bead.id, bead.project_id);
        guard.blocked_count.insert(bead.id, 0);
        guard.beads.insert(bead.id, bead);
    }

    /// Recompute every shard's unresolved-dependency index from the bead
    /// records themselves.
    pub(crate) async fn rebuild_blocked_counts(&self) {
        let shards: Vec<Arc<RwLock<Shard>>> =
            self.shards.iter().map(|e| e.value().clone()).collect();
        for shard in shards {
            let mut guard = shard.write().await;
            let counts: Vec<(Uuid, usize)> = guard
                .beads
                .values()
                .map(|bead| {
                    let unresolved = bead
                        .blocked_by
                        .iter()
                        .filter(|dep| {
                            guard
                                .beads
                                .get(dep)
                                .map(|b| !b.status.is_terminal())
                                .unwrap_or(false)
                        })
                        .count();
                    (bead.id, unresolved)
                })
                .collect();
            for (id, count) in counts {
                guard.blocked_count.insert(id, count);
            }
        }
    }

    /// Drop every project, bead and index entry. Used by replace imports.
    pub(crate) async fn clear_all(&self) {
        self.shards.clear();
        self.bead_index.clear();
        self.projects.write().await.clear();
    }

    pub(crate) async fn has_project(&self, id: Uuid) -> bool {
        self.projects.read().await.contains_key(&id)
    }

    // ----- projects --------------------------------------------------------

    pub async fn create_project(&self, name: impl Into<String>) -> Project {
        let project = Project::new(name);
        self.insert_project(project.clone()).await;
        project
    }

    pub(crate) async fn insert_project(&self, project: Project) {
        self.projects.write().await.insert(project.id, project);
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Project, StoreError> {
        self.projects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::ProjectNotFound(id))
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self.projects.read().await.values().cloned().collect();
        projects.sort_by_key(|p| p.created_at);
        projects
    }

    pub async fn add_project_comment(
        &self,
        id: Uuid,
        author: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Project, StoreError> {
        let mut projects = self.projects.write().await;
        let project = projects.get_mut(&id).ok_or(StoreError::ProjectNotFound(id))?;
        project.comments.push(ProjectComment {
            author: author.into(),
            body: body.into(),
            created_at: Utc::now(),
        });
        project.updated_at = Utc::now();
        Ok(project.clone())
    }

    /// Change a project's status. Closing requires either no open beads or
    /// a terminal decision bead referenced in `approved_by`.
    pub async fn set_project_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
        approved_by: Option<Uuid>,
    ) -> Result<Project, StoreError> {
        if status == ProjectStatus::Closed {
            let shard = self.shard(id);
            let guard = shard.read().await;
            let open_count = guard
                .beads
                .values()
                .filter(|b| !b.status.is_terminal())
                .count();
            if open_count > 0 {
                let approved = match approved_by {
                    Some(decision_bead) => guard
                        .beads
                        .get(&decision_bead)
                        .map(|b| b.bead_type == BeadType::Decision && b.status.is_terminal())
                        .unwrap_or(false),
                    None => false,
                };
                if !approved {
                    return Err(StoreError::ProjectHasOpenBeads(id));
                }
            }
        }

        let mut projects = self.projects.write().await;
        let project = projects.get_mut(&id).ok_or(StoreError::ProjectNotFound(id))?;
        project.status = status;
        project.updated_at = Utc::now();
        if let Some(decision_bead) = approved_by {
            project.comments.push(ProjectComment {
                author: "coordinator".into(),
                body: format!("closed with open beads, approved by decision bead {decision_bead}"),
                created_at: Utc::now(),
            });
        }
        Ok(project.clone())
    }

    pub(crate) async fn project_status(&self, id: Uuid) -> Result<ProjectStatus, StoreError> {
        self.projects
            .read()
            .await
            .get(&id)
            .map(|p| p.status)
            .ok_or(StoreError::ProjectNotFound(id))
    }

    // ----- beads -----------------------------------------------------------

    pub async fn create(&self, new: NewBead) -> Result<Bead, StoreError> {
        if new.title.trim().is_empty() {
            return Err(StoreError::InvalidArgument("title must not be empty".into()));
        }
        if new.priority > 3 {
            return Err(StoreError::InvalidArgument(format!(
                "priority must be 0-3, got {}",
                new.priority
            )));
        }
        let project_status = self.project_status(new.project_id).await?;
        if project_status == ProjectStatus::Closed {
            return Err(StoreError::ProjectClosed(new.project_id));
        }

        let shard = self.shard(new.project_id);
        let mut guard = shard.write().await;

        for dep in &new.blocked_by {
            if !guard.beads.contains_key(dep) {
                return Err(StoreError::BeadNotFound(*dep));
            }
        }
        if let Some(parent) = new.parent_id {
            if !guard.beads.contains_key(&parent) {
                return Err(StoreError::BeadNotFound(parent));
            }
        }

        let mut bead = Bead::new(new.title, new.bead_type, new.project_id);
        bead.description = new.description;
        bead.priority = new.priority;
        bead.parent_id = new.parent_id;
        bead.tags = new.tags;
        bead.blocked_by = new.blocked_by.clone();
        bead.context = new.context;

        let unresolved = new
            .blocked_by
            .iter()
            .filter(|dep| {
                guard
                    .beads
                    .get(dep)
                    .map(|b| !b.status.is_terminal())
                    .unwrap_or(false)
            })
            .count();

        for dep in &new.blocked_by {
            if let Some(target) = guard.beads.get_mut(dep) {
                target.blocks.insert(bead.id);
            }
        }
        if let Some(parent) = new.parent_id {
            if let Some(target) = guard.beads.get_mut(&parent) {
                target.children.insert(bead.id);
            }
        }

        guard.blocked_count.insert(bead.id, unresolved);
        guard.beads.insert(bead.id, bead.clone());
        drop(guard);

        self.bead_index.insert(bead.id, bead.project_id);

        tracing::info!(bead_id = %bead.id, project_id = %bead.project_id, title = %bead.title, "bead created");
        self.bus.publish(
            BusEvent::new(topics::BEAD_CREATED, "bead_store")
                .with_project(bead.project_id)
                .with_data("bead_id", serde_json::json!(bead.id))
                .with_data("bead_type", serde_json::json!(bead.bead_type)),
        );

        Ok(bead)
    }

    pub async fn get(&self, id: Uuid) -> Result<Bead, StoreError> {
        let project = self.project_of(id).ok_or(StoreError::BeadNotFound(id))?;
        let shard = self.shard(project);
        let guard = shard.read().await;
        guard.beads.get(&id).cloned().ok_or(StoreError::BeadNotFound(id))
    }

    /// Snapshot-consistent listing: each project shard is read under its
    /// read lock; results are ordered by creation time.
    pub async fn list(&self, filter: &BeadFilter) -> Vec<Bead> {
        let mut out = Vec::new();
        if let Some(project) = filter.project_id {
            let shard = self.shard(project);
            let guard = shard.read().await;
            out.extend(guard.beads.values().filter(|b| filter.matches(b)).cloned());
        } else {
            let shards: Vec<Arc<RwLock<Shard>>> =
                self.shards.iter().map(|e| e.value().clone()).collect();
            for shard in shards {
                let guard = shard.read().await;
                out.extend(guard.beads.values().filter(|b| filter.matches(b)).cloned());
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn update(&self, id: Uuid, patch: BeadPatch) -> Result<Bead, StoreError> {
        let project_id = self.project_of(id).ok_or(StoreError::BeadNotFound(id))?;
        let project_status = self.project_status(project_id).await?;
        let shard = self.shard(project_id);
        let mut guard = shard.write().await;

        let current = guard
            .beads
            .get(&id)
            .cloned()
            .ok_or(StoreError::BeadNotFound(id))?;
        let mut updated = current.clone();

        if let Some(title) = patch.title {
            if title.trim().is_empty() {
                return Err(StoreError::InvalidArgument("title must not be empty".into()));
            }
            updated.title = title;
        }
        if let Some(description) = patch.description {
            updated.description = Some(description);
        }
        if let Some(bead_type) = patch.bead_type {
            updated.bead_type = bead_type;
        }
        if let Some(priority) = patch.priority {
            if priority > 3 {
                return Err(StoreError::InvalidArgument(format!(
                    "priority must be 0-3, got {priority}"
                )));
            }
            updated.priority = priority;
        }
        if let Some(tags) = patch.tags {
            updated.tags = tags;
        }
        if let Some(related) = patch.related_to {
            updated.related_to = related;
        }
        if let Some(assigned) = patch.assigned_to {
            updated.assigned_to = assigned;
        }
        if let Some(context) = patch.context {
            if patch.replace_context {
                updated.context = context;
            } else {
                for (key, value) in context {
                    updated.context.insert(key, value);
                }
            }
        }

        if let Some(ref new_deps) = patch.blocked_by {
            if new_deps.contains(&id) {
                return Err(StoreError::DependencyCycle(id));
            }
            for dep in new_deps {
                if !guard.beads.contains_key(dep) {
                    return Err(StoreError::BeadNotFound(*dep));
                }
            }
            if creates_cycle(&guard, id, new_deps) {
                return Err(StoreError::DependencyCycle(id));
            }
            updated.blocked_by = new_deps.clone();
        }

        if let Some(status) = patch.status {
            if status != updated.status {
                if !current.status.can_transition_to(&status) {
                    return Err(StoreError::InvalidTransition {
                        from: current.status,
                        to: status,
                    });
                }
                if project_status == ProjectStatus::Closed
                    && matches!(status, BeadStatus::Open | BeadStatus::Claimed)
                {
                    return Err(StoreError::ProjectClosed(project_id));
                }
                if status == BeadStatus::Claimed && updated.assigned_to.is_none() {
                    return Err(StoreError::InvalidArgument(
                        "claimed bead requires an assignee".into(),
                    ));
                }
                updated.status = status;
                if status.is_terminal() {
                    updated.closed_at = Some(Utc::now());
                    updated.assigned_to = None;
                }
                if status == BeadStatus::Open {
                    updated.assigned_to = None;
                }
            }
        }

        // Idempotence: equivalent payloads commit and publish nothing.
        if beads_equivalent(&current, &updated) {
            return Ok(current);
        }
        updated.updated_at = Utc::now();

        // Rewire inverse edges when the dependency set changed.
        if updated.blocked_by != current.blocked_by {
            let removed: Vec<Uuid> = current
                .blocked_by
                .difference(&updated.blocked_by)
                .copied()
                .collect();
            let added: Vec<Uuid> = updated
                .blocked_by
                .difference(&current.blocked_by)
                .copied()
                .collect();
            for dep in removed {
                if let Some(target) = guard.beads.get_mut(&dep) {
                    target.blocks.remove(&id);
                }
            }
            for dep in &added {
                if let Some(target) = guard.beads.get_mut(dep) {
                    target.blocks.insert(id);
                }
            }
            let unresolved = updated
                .blocked_by
                .iter()
                .filter(|dep| {
                    guard
                        .beads
                        .get(dep)
                        .map(|b| !b.status.is_terminal())
                        .unwrap_or(false)
                })
                .count();
            guard.blocked_count.insert(id, unresolved);
        }

        let became_terminal = !current.status.is_terminal() && updated.status.is_terminal();
        guard.beads.insert(id, updated.clone());
        if became_terminal {
            settle_dependents(&mut guard, id);
        }
        drop(guard);

        self.bus.publish(
            BusEvent::new(topics::BEAD_UPDATED, "bead_store")
                .with_project(project_id)
                .with_data("bead_id", serde_json::json!(id))
                .with_data("status", serde_json::json!(updated.status)),
        );
        if updated.status == BeadStatus::Cancelled && current.status != BeadStatus::Cancelled {
            self.bus.publish(
                BusEvent::new(topics::BEAD_CANCELLED, "bead_store")
                    .with_project(project_id)
                    .with_data("bead_id", serde_json::json!(id)),
            );
        }

        Ok(updated)
    }

    /// Apply `patch` to every bead matching `filter`. Individual failures
    /// are logged and skipped; the primary loop is never rolled back.
    pub async fn bulk_update(&self, filter: &BeadFilter, patch: BeadPatch) -> Vec<Bead> {
        let targets = self.list(filter).await;
        let mut updated = Vec::with_capacity(targets.len());
        for bead in targets {
            match self.update(bead.id, patch.clone()).await {
                Ok(b) => updated.push(b),
                Err(e) => {
                    tracing::warn!(bead_id = %bead.id, error = %e, "bulk update skipped bead")
                }
            }
        }
        updated
    }

    /// Beads of `project` eligible for immediate claim: open, project not
    /// closed, every dependency terminal. Ordered by (priority asc,
    /// created_at asc).
    pub async fn ready_set(&self, project_id: Uuid) -> Result<Vec<Bead>, StoreError> {
        let status = self.project_status(project_id).await?;
        if status == ProjectStatus::Closed {
            return Ok(Vec::new());
        }
        let shard = self.shard(project_id);
        let guard = shard.read().await;
        let mut ready: Vec<Bead> = guard
            .beads
            .values()
            .filter(|b| {
                b.status == BeadStatus::Open
                    && guard.blocked_count.get(&b.id).copied().unwrap_or(0) == 0
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(ready)
    }

    /// Adjacency-list view of a project's beads for DAG rendering.
    pub async fn graph(&self, project_id: Uuid) -> Result<WorkGraph, StoreError> {
        self.project_status(project_id).await?;
        let shard = self.shard(project_id);
        let guard = shard.read().await;
        let nodes = guard
            .beads
            .values()
            .map(|b| {
                (
                    b.id,
                    GraphNode {
                        id: b.id,
                        title: b.title.clone(),
                        status: b.status,
                        bead_type: b.bead_type,
                        priority: b.priority,
                        blocked_by: b.blocked_by.iter().copied().collect(),
                        blocks: b.blocks.iter().copied().collect(),
                        children: b.children.iter().copied().collect(),
                    },
                )
            })
            .collect();
        Ok(WorkGraph { project_id, nodes })
    }
}

/// Equality modulo bookkeeping timestamps, for idempotence checks.
fn beads_equivalent(a: &Bead, b: &Bead) -> bool {
    a.title == b.title
        && a.description == b.description
        && a.bead_type == b.bead_type
        && a.priority == b.priority
        && a.status == b.status
        && a.tags == b.tags
        && a.blocked_by == b.blocked_by
        && a.related_to == b.related_to
        && a.assigned_to == b.assigned_to
        && a.context == b.context
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
