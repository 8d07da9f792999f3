use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use fil_core::error::StoreError;
use fil_core::types::{ConversationMessage, MessageRole};

/// Default lifetime of a session before it may be reaped.
const SESSION_TTL_HOURS: i64 = 24;

/// Approximate tokens for a piece of text: one token per four bytes.
pub fn approx_tokens(content: &str) -> u64 {
    (content.len() / 4) as u64
}

// ---------------------------------------------------------------------------
// ConversationSession
// ---------------------------------------------------------------------------

/// Per-bead transcript used to drive provider completions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: Uuid,
    pub bead_id: Uuid,
    pub project_id: Uuid,
    pub messages: Vec<ConversationMessage>,
    pub total_tokens: u64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Model limits
// ---------------------------------------------------------------------------

/// Hard context limit for a model name; 100k for anything unknown.
pub fn model_token_limit(model: &str) -> u64 {
    match model {
        "gpt-3.5-turbo" => 4_096,
        "gpt-4" => 8_192,
        m if m.starts_with("gpt-4-turbo") || m.starts_with("gpt-4o") => 128_000,
        m if m.starts_with("claude-") => 200_000,
        _ => 100_000,
    }
}

/// Project a transcript into a model's context budget (80% of the hard
/// limit).
///
/// A leading `system` message is always preserved. The tail is kept
/// newest-first until the budget is exhausted; a synthetic notice marks the
/// cut. When nothing but the protected message fits, that single message is
/// returned alone.
pub fn apply_token_limits(messages: &[ConversationMessage], model: &str) -> Vec<ConversationMessage> {
    let limit = model_token_limit(model);
    let budget = (limit as f64 * 0.8) as u64;

    let total: u64 = messages.iter().map(|m| m.tokens).sum();
    if total <= budget || messages.is_empty() {
        return messages.to_vec();
    }

    let (system, rest): (Option<&ConversationMessage>, &[ConversationMessage]) =
        match messages.first() {
            Some(first) if first.role == MessageRole::System => (Some(first), &messages[1..]),
            _ => (None, messages),
        };

    let mut acc: u64 = system.map(|m| m.tokens).unwrap_or(0);
    let mut kept_rev: Vec<ConversationMessage> = Vec::new();
    for message in rest.iter().rev() {
        if acc + message.tokens > budget {
            break;
        }
        acc += message.tokens;
        kept_rev.push(message.clone());
    }

    if kept_rev.is_empty() {
        // Nothing beyond the protected head fits; return a single message.
        return match (system, rest.last()) {
            (Some(head), _) => vec![head.clone()],
            (None, Some(last)) => vec![last.clone()],
            (None, None) => Vec::new(),
        };
    }

    let truncated = rest.len() - kept_rev.len();
    let notice_text =
        format!("[Note: {truncated} older messages truncated to fit the context window]");
    let notice = ConversationMessage {
        role: MessageRole::System,
        tokens: approx_tokens(&notice_text),
        content: notice_text,
        created_at: Utc::now(),
    };

    let mut out = Vec::with_capacity(kept_rev.len() + 2);
    if let Some(head) = system {
        out.push(head.clone());
    }
    out.push(notice);
    out.extend(kept_rev.into_iter().rev());
    out
}

// ---------------------------------------------------------------------------
// ConversationStore
// ---------------------------------------------------------------------------

/// Owner of conversation sessions, addressable by session id or bead id.
pub struct ConversationStore {
    sessions: RwLock<HashMap<Uuid, ConversationSession>>,
    by_bead: RwLock<HashMap<Uuid, Uuid>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_bead: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, bead_id: Uuid, project_id: Uuid) -> ConversationSession {
        let now = Utc::now();
        let session = ConversationSession {
            session_id: Uuid::new_v4(),
            bead_id,
            project_id,
            messages: Vec::new(),
            total_tokens: 0,
            expires_at: now + Duration::hours(SESSION_TTL_HOURS),
            created_at: now,
            updated_at: now,
        };
        self.sessions
            .write()
            .await
            .insert(session.session_id, session.clone());
        self.by_bead.write().await.insert(bead_id, session.session_id);
        session
    }

    pub(crate) async fn insert(&self, session: ConversationSession) {
        self.by_bead
            .write()
            .await
            .insert(session.bead_id, session.session_id);
        self.sessions
            .write()
            .await
            .insert(session.session_id, session);
    }

    pub async fn get(&self, session_id: Uuid) -> Result<ConversationSession, StoreError> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(StoreError::SessionNotFound)
    }

    pub async fn get_by_bead(&self, bead_id: Uuid) -> Result<ConversationSession, StoreError> {
        let session_id = *self
            .by_bead
            .read()
            .await
            .get(&bead_id)
            .ok_or(StoreError::SessionNotFound)?;
        self.get(session_id).await
    }

    /// Find the session for a bead, creating one if none exists yet.
    pub async fn get_or_create(&self, bead_id: Uuid, project_id: Uuid) -> ConversationSession {
        if let Ok(session) = self.get_by_bead(bead_id).await {
            return session;
        }
        self.create(bead_id, project_id).await
    }

    /// Append a message, accruing its approximate token count.
    pub async fn append(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Result<ConversationSession, StoreError> {
        let content = content.into();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(StoreError::SessionNotFound)?;
        let tokens = approx_tokens(&content);
        session.messages.push(ConversationMessage {
            role,
            content,
            tokens,
            created_at: Utc::now(),
        });
        session.total_tokens += tokens;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    /// Clear a session's transcript, optionally preserving the leading
    /// system message.
    pub async fn reset(
        &self,
        session_id: Uuid,
        keep_system: bool,
    ) -> Result<ConversationSession, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(StoreError::SessionNotFound)?;
        let system = match session.messages.first() {
            Some(first) if keep_system && first.role == MessageRole::System => {
                Some(first.clone())
            }
            _ => None,
        };
        session.messages.clear();
        session.total_tokens = 0;
        if let Some(system) = system {
            session.total_tokens = system.tokens;
            session.messages.push(system);
        }
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    pub async fn delete(&self, session_id: Uuid) -> Result<(), StoreError> {
        let removed = self
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or(StoreError::SessionNotFound)?;
        self.by_bead.write().await.remove(&removed.bead_id);
        Ok(())
    }

    /// Sessions of a project, most recently updated first, capped at `limit`.
    pub async fn list(&self, project_id: Uuid, limit: usize) -> Vec<ConversationSession> {
        let mut out: Vec<ConversationSession> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out.truncate(limit);
        out
    }

    pub(crate) async fn all(&self) -> Vec<ConversationSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub(crate) async fn contains(&self, session_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    pub(crate) async fn clear_all(&self) {
        self.sessions.write().await.clear();
        self.by_bead.write().await.clear();
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
