//! In-process pub/sub for filament.
//!
//! The bus is fire-and-forget and best-effort: each subscriber owns a
//! bounded buffer and overflow drops events for that subscriber only.
//! A ring buffer of recent events backs late history queries.

pub mod bus;
pub mod log_handler;
pub mod topics;

pub use bus::{EventBus, EventFilter, Subscription};
pub use log_handler::{LogHandler, LogLevel, LogQuery, LogRecord};
