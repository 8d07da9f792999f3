//! Core library for filament — foundational types shared by every other
//! crate in the workspace.
//!
//! This crate provides:
//! - The bead work-unit model and its status state machine
//! - Project, agent, decision, motivation-rule and file-lock records
//! - The bus event envelope
//! - The error taxonomy used across component boundaries
//! - Daemon configuration infrastructure

pub mod config;
pub mod error;
pub mod types;
