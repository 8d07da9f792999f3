//! Authoritative state for filament: beads and their work graph, projects,
//! claims, file locks, conversations and decisions.
//!
//! The bead store exclusively owns bead records; all mutation goes through
//! it. Writes are serialized per project so unrelated projects never
//! contend. Every committed transition is published on the event bus.

pub mod beads;
pub mod claim;
pub mod conversation;
pub mod decisions;
pub mod export;
pub mod locks;

pub use beads::{BeadFilter, BeadPatch, BeadStore, GraphNode, NewBead, WorkGraph};
pub use claim::{ClaimCoordinator, ReleaseOutcome};
pub use conversation::{
    apply_token_limits, approx_tokens, model_token_limit, ConversationSession, ConversationStore,
};
pub use decisions::DecisionManager;
pub use export::{
    export_state, import_state, ExportDocument, ImportReport, ImportStrategy, SCHEMA_VERSION,
};
pub use locks::{normalize_path, FileLockManager};
