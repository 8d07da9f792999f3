//! Well-known event types published on the bus.
//!
//! Types use a dotted namespace; subscribers may filter by prefix
//! (e.g. `bead.` matches every bead lifecycle event).

pub const BEAD_CREATED: &str = "bead.created";
pub const BEAD_UPDATED: &str = "bead.updated";
pub const BEAD_COMPLETED: &str = "bead.completed";
pub const BEAD_FAILED: &str = "bead.failed";
pub const BEAD_REDISPATCHED: &str = "bead.redispatched";
pub const BEAD_ESCALATED: &str = "bead.escalated";
pub const BEAD_CANCELLED: &str = "bead.cancelled";

pub const DECISION_CREATED: &str = "decision.created";
pub const DECISION_RESOLVED: &str = "decision.resolved";

pub const AGENT_SPAWNED: &str = "agent.spawned";
pub const AGENT_IDLE: &str = "agent.idle";
pub const AGENT_STOPPED: &str = "agent.stopped";

pub const FILE_LOCK_ACQUIRED: &str = "file_lock.acquired";
pub const FILE_LOCK_RELEASED: &str = "file_lock.released";

pub const MOTIVATION_TRIGGERED: &str = "motivation.triggered";

pub const DISPATCHER_PAUSED: &str = "dispatcher.paused";
pub const DISPATCHER_RESUMED: &str = "dispatcher.resumed";

pub const CONFIG_UPDATED: &str = "config.updated";

/// Prefix for normalized external webhook events, completed with
/// `<source>.<event>` by the webhook router.
pub const EXTERNAL_PREFIX: &str = "external.";
