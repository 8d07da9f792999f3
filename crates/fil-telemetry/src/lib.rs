//! Telemetry bootstrap for filament services.

pub mod logging;
