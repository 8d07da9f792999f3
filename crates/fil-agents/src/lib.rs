//! Agent lifecycle, scheduling and motivation for filament.
//!
//! - [`agents::AgentManager`] owns agent records, per-agent inboxes and the
//!   streaming session that drives a claimed bead through a provider.
//! - [`dispatcher::Dispatcher`] matches ready beads to idle compatible
//!   agents, with coalesced backpressure and pause/drain semantics.
//! - [`motivation::MotivationEngine`] turns time/event/idle/threshold
//!   triggers into beads and agent wake-ups.

pub mod agents;
pub mod dispatcher;
pub mod idle;
pub mod motivation;

pub use agents::{AgentManager, AgentSignal, SessionError};
pub use dispatcher::{Dispatcher, DispatcherState, DispatcherStatus};
pub use idle::IdleDetector;
pub use motivation::{MetricSource, MotivationEngine, NewRule, RuleFilter, RulePatch};
